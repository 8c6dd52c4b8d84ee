//! Deal blast fanout to matched buyers.
//!
//! Dedup is layered: an existing BuyerDeal with blast_sent_at skips,
//! and a per-(buyer, lead, day) idempotency key protects the send
//! itself. Buyer stats update only on a confirmed send.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::deal_sheet::{DealSheetContent, DealSheetService};
use super::matcher::{BuyerMatch, BuyerMatcher};
use crate::idempotency;
use crate::models::{AttemptStatus, BuyerDealStage, MessageContext};
use crate::outreach::twilio::{SmsResult, TwilioClient};
use crate::store::Store;

pub const DEFAULT_MIN_MATCH_SCORE: f64 = 50.0;
pub const DEFAULT_MAX_BUYERS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct BlastEntry {
    pub buyer_id: i64,
    pub buyer_name: String,
    pub status: &'static str,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BlastResult {
    pub lead_id: i64,
    pub buyers_matched: usize,
    pub buyers_blasted: usize,
    pub buyers_skipped: usize,
    pub buyers_failed: usize,
    pub entries: Vec<BlastEntry>,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct BuyerBlastService {
    store: Store,
    matcher: BuyerMatcher,
    deal_sheets: DealSheetService,
    twilio: Option<Arc<TwilioClient>>,
    dry_run: bool,
}

impl BuyerBlastService {
    pub fn new(
        store: Store,
        matcher: BuyerMatcher,
        deal_sheets: DealSheetService,
        twilio: Option<Arc<TwilioClient>>,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            matcher,
            deal_sheets,
            twilio,
            dry_run,
        }
    }

    /// Blast a lead's deal sheet to its top matches.
    pub async fn send_blast(
        &self,
        lead_id: i64,
        buyer_ids: Option<Vec<i64>>,
        min_match_score: f64,
        max_buyers: usize,
        dry_run_override: bool,
    ) -> Result<BlastResult> {
        let mut result = BlastResult {
            lead_id,
            ..Default::default()
        };
        let dry_run = self.dry_run || dry_run_override;

        let Some(bundle) = self.store.get_lead_bundle(lead_id).await? else {
            result.errors.push("lead not found".into());
            return Ok(result);
        };

        let Some(sheet) = self.deal_sheets.generate(lead_id, false).await? else {
            result.errors.push("deal sheet generation failed".into());
            return Ok(result);
        };

        let matches = match buyer_ids {
            Some(ids) => {
                // Explicit buyer list bypasses the rubric filter.
                let buyers = self.store.get_buyers_by_ids(&ids).await?;
                buyers
                    .iter()
                    .map(|b| super::matcher::score_buyer(
                        b,
                        &bundle.lead.market_code,
                        Some(bundle.parcel.parish.as_str()),
                        bundle.parcel.lot_size_acres,
                        Some(sheet.recommended_offer as f64),
                    ))
                    .collect()
            }
            None => {
                self.matcher
                    .match_buyers(
                        &bundle,
                        Some(sheet.recommended_offer as f64),
                        min_match_score,
                        max_buyers * 2,
                    )
                    .await?
            }
        };
        result.buyers_matched = matches.len();

        for m in matches.into_iter().take(max_buyers) {
            match self.blast_one(lead_id, &m, &sheet, dry_run).await {
                Ok(entry) => {
                    match entry.status {
                        "sent" | "dry_run" => result.buyers_blasted += 1,
                        "failed" => result.buyers_failed += 1,
                        _ => result.buyers_skipped += 1,
                    }
                    result.entries.push(entry);
                }
                Err(e) => {
                    warn!(lead_id, buyer_id = m.buyer_id, error = %e, "blast failed");
                    result.buyers_failed += 1;
                    result.errors.push(format!("buyer {}: {e:#}", m.buyer_id));
                }
            }
        }

        self.store
            .append_timeline_event(
                lead_id,
                "buyer_blast",
                &format!("Buyer blast sent to {} buyers", result.buyers_blasted),
                Some(&format!(
                    "matched {}, skipped {}, failed {}",
                    result.buyers_matched, result.buyers_skipped, result.buyers_failed
                )),
                None,
            )
            .await?;

        info!(
            lead_id,
            blasted = result.buyers_blasted,
            skipped = result.buyers_skipped,
            "buyer blast complete"
        );
        Ok(result)
    }

    async fn blast_one(
        &self,
        lead_id: i64,
        m: &BuyerMatch,
        sheet: &DealSheetContent,
        dry_run: bool,
    ) -> Result<BlastEntry> {
        let entry = |status: &'static str, reason: Option<String>| BlastEntry {
            buyer_id: m.buyer_id,
            buyer_name: m.buyer_name.clone(),
            status,
            reason,
        };

        // Already blasted for this lead: permanent skip.
        let existing = self.store.get_buyer_deal(m.buyer_id, lead_id).await?;
        if existing.as_ref().and_then(|d| d.blast_sent_at).is_some() {
            return Ok(entry("skipped", Some("already blasted".into())));
        }

        let Some(phone) = m.buyer_phone.as_deref().filter(|p| !p.trim().is_empty()) else {
            return Ok(entry("skipped", Some("no phone number".into())));
        };

        // One blast per (buyer, lead, day).
        let key = idempotency::blast_key(lead_id, m.buyer_id, &idempotency::date_key(Utc::now()));
        let Some(attempt) = self
            .store
            .reserve_attempt(lead_id, &key, "sms", MessageContext::Intro)
            .await?
        else {
            return Ok(entry("skipped", Some("duplicate prevented".into())));
        };

        let deal_id = self
            .store
            .upsert_buyer_deal(
                m.buyer_id,
                lead_id,
                existing.map(|d| d.stage).unwrap_or(BuyerDealStage::New),
                m.match_percentage,
            )
            .await?;

        let body = blast_message(m, sheet);

        if dry_run {
            self.store
                .finalize_attempt(
                    attempt.id,
                    AttemptStatus::DryRun,
                    "dry_run",
                    Some(&body),
                    Some("dry_run"),
                    None,
                    None,
                )
                .await?;
            let now = Utc::now();
            self.store.mark_deal_blasted(deal_id, now).await?;
            return Ok(entry("dry_run", None));
        }

        let Some(twilio) = self.twilio.as_deref() else {
            self.store
                .finalize_attempt(
                    attempt.id,
                    AttemptStatus::Failed,
                    "not_configured",
                    Some(&body),
                    None,
                    Some("sms gateway not configured"),
                    None,
                )
                .await?;
            return Ok(entry("failed", Some("sms gateway not configured".into())));
        };

        match twilio.send_sms(phone, &body).await {
            Ok(SmsResult::Accepted { sid, .. }) => {
                let now = Utc::now();
                self.store
                    .finalize_attempt(
                        attempt.id,
                        AttemptStatus::Sent,
                        "sent",
                        Some(&body),
                        Some(&sid),
                        None,
                        Some(now),
                    )
                    .await?;
                self.store.mark_deal_blasted(deal_id, now).await?;
                self.store.record_buyer_deal_sent(m.buyer_id, now).await?;
                Ok(entry("sent", None))
            }
            Ok(SmsResult::Rejected { message, .. }) => {
                self.store
                    .finalize_attempt(
                        attempt.id,
                        AttemptStatus::Failed,
                        "twilio_error",
                        Some(&body),
                        None,
                        Some(&message),
                        None,
                    )
                    .await?;
                Ok(entry("failed", Some(message)))
            }
            Err(e) => {
                self.store
                    .finalize_attempt(
                        attempt.id,
                        AttemptStatus::Failed,
                        "error",
                        Some(&body),
                        None,
                        Some(&format!("{e:#}")),
                        None,
                    )
                    .await?;
                Ok(entry("failed", Some(format!("{e:#}"))))
            }
        }
    }
}

/// Buyer-facing blast SMS.
fn blast_message(m: &BuyerMatch, sheet: &DealSheetContent) -> String {
    let acres = sheet
        .acreage
        .map(|a| format!("{a:.2} acres"))
        .unwrap_or_else(|| "land".into());
    let price = if sheet.offer.can_make_offer {
        format!("${}", sheet.recommended_offer)
    } else {
        "price on request".into()
    };

    format!(
        "NEW LAND DEAL - {}, {}\n{acres}\nPrice: {price}\n{}\n\
         Interested {}? Reply YES for full details. Reply STOP to opt out.",
        sheet.county,
        sheet.state.as_deref().unwrap_or("LA"),
        sheet
            .ai_description
            .as_deref()
            .unwrap_or(&sheet.owner_situation),
        m.buyer_name.split_whitespace().next().unwrap_or("investor"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::store::{IngestParcel, NewBuyer};

    async fn seed_lead(store: &Store) -> i64 {
        let (parcel_id, _) = store
            .upsert_parcel(&IngestParcel {
                canonical_parcel_id: "BL1".into(),
                parish: "East Baton Rouge".into(),
                market_code: "LA".into(),
                land_assessed_value: Some(40_000.0),
                lot_size_acres: Some(3.2),
                ..Default::default()
            })
            .await
            .unwrap();
        let (party_id, _) = store
            .upsert_party("hb", "JOHN DOE", "70801", "John Doe", None, "LA")
            .await
            .unwrap();
        let (owner_id, _) = store
            .ensure_owner(party_id, Some("+12255550147"), None, true)
            .await
            .unwrap();
        store.upsert_lead(owner_id, parcel_id, "LA").await.unwrap().0
    }

    async fn seed_buyer(store: &Store, name: &str, phone: Option<&str>) -> i64 {
        store
            .insert_buyer(&NewBuyer {
                name: name.into(),
                phone: phone.map(Into::into),
                market_codes: vec!["LA".into()],
                counties: vec!["East Baton Rouge".into()],
                min_acres: Some(1.0),
                max_acres: Some(5.0),
                price_min: Some(10_000.0),
                price_max: Some(30_000.0),
                vip: true,
                pof_verified: true,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    fn service(store: &Store) -> BuyerBlastService {
        BuyerBlastService::new(
            store.clone(),
            BuyerMatcher::new(store.clone()),
            DealSheetService::new(store.clone(), None, 1.4, false),
            None,
            true,
        )
    }

    #[tokio::test]
    async fn blast_sends_once_per_buyer() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store).await;
        let buyer_id = seed_buyer(&store, "Acme Fund", Some("+15125550100")).await;
        let blast = service(&store);

        let result = blast
            .send_blast(lead_id, None, DEFAULT_MIN_MATCH_SCORE, DEFAULT_MAX_BUYERS, false)
            .await
            .unwrap();
        assert_eq!(result.buyers_matched, 1);
        assert_eq!(result.buyers_blasted, 1);

        let deal = store.get_buyer_deal(buyer_id, lead_id).await.unwrap().unwrap();
        assert_eq!(deal.stage, BuyerDealStage::DealSent);
        assert!(deal.blast_sent_at.is_some());

        // Second blast: the existing deal skips.
        let result = blast
            .send_blast(lead_id, None, DEFAULT_MIN_MATCH_SCORE, DEFAULT_MAX_BUYERS, false)
            .await
            .unwrap();
        assert_eq!(result.buyers_blasted, 0);
        assert_eq!(result.buyers_skipped, 1);
    }

    #[tokio::test]
    async fn phoneless_buyer_is_skipped() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store).await;
        seed_buyer(&store, "No Phone LLC", None).await;
        let blast = service(&store);

        let result = blast
            .send_blast(lead_id, None, DEFAULT_MIN_MATCH_SCORE, DEFAULT_MAX_BUYERS, false)
            .await
            .unwrap();
        assert_eq!(result.buyers_blasted, 0);
        assert_eq!(result.buyers_skipped, 1);
        assert_eq!(result.entries[0].reason.as_deref(), Some("no phone number"));
    }

    #[tokio::test]
    async fn low_match_buyers_are_filtered() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store).await;
        // Texas-only buyer with no county overlap and tiny budget.
        store
            .insert_buyer(&NewBuyer {
                name: "Wrong Market".into(),
                phone: Some("+15125550101".into()),
                market_codes: vec!["TX".into()],
                counties: vec!["Harris".into()],
                min_acres: Some(10.0),
                max_acres: Some(100.0),
                price_min: Some(100.0),
                price_max: Some(200.0),
                ..Default::default()
            })
            .await
            .unwrap();
        let blast = service(&store);

        let result = blast
            .send_blast(lead_id, None, DEFAULT_MIN_MATCH_SCORE, DEFAULT_MAX_BUYERS, false)
            .await
            .unwrap();
        assert_eq!(result.buyers_matched, 0);
        assert_eq!(result.buyers_blasted, 0);
    }
}
