//! Call preparation: prep pack, offer readout and a call script for
//! the human caller picking up a hot lead.

use anyhow::Result;
use serde::Serialize;

use super::deal_sheet::{compute_offer_range, OfferRange, DEFAULT_DISCOUNT_HIGH, DEFAULT_DISCOUNT_LOW};
use crate::models::{LeadBundle, TimelineEvent};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct PrepPack {
    pub lead: crate::models::Lead,
    pub owner_display_name: String,
    pub owner_phone: Option<String>,
    pub parcel: crate::models::Parcel,
    pub score_details: Option<serde_json::Value>,
    pub offer: OfferRange,
    pub recent_timeline: Vec<TimelineEvent>,
}

#[derive(Clone)]
pub struct CallPrepService {
    store: Store,
}

impl CallPrepService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Everything a caller needs on screen before dialing, with
    /// optional discount overrides for the offer range.
    pub async fn prep_pack(
        &self,
        lead_id: i64,
        discount_low: Option<f64>,
        discount_high: Option<f64>,
    ) -> Result<Option<PrepPack>> {
        let Some(bundle) = self.store.get_lead_bundle(lead_id).await? else {
            return Ok(None);
        };

        let offer = compute_offer_range(
            Some(&bundle.parcel),
            discount_low.unwrap_or(DEFAULT_DISCOUNT_LOW),
            discount_high.unwrap_or(DEFAULT_DISCOUNT_HIGH),
        );
        let recent_timeline = self.store.list_timeline(lead_id, 10).await?;

        Ok(Some(PrepPack {
            owner_display_name: bundle.party.display_name.clone(),
            owner_phone: bundle.owner.phone_primary.clone(),
            score_details: bundle.lead.score_details.clone(),
            lead: bundle.lead,
            parcel: bundle.parcel,
            offer,
            recent_timeline,
        }))
    }

    pub async fn offer(&self, lead_id: i64) -> Result<Option<OfferRange>> {
        let Some(bundle) = self.store.get_lead_bundle(lead_id).await? else {
            return Ok(None);
        };
        Ok(Some(compute_offer_range(
            Some(&bundle.parcel),
            DEFAULT_DISCOUNT_LOW,
            DEFAULT_DISCOUNT_HIGH,
        )))
    }

    pub async fn script(&self, lead_id: i64) -> Result<Option<String>> {
        let Some(bundle) = self.store.get_lead_bundle(lead_id).await? else {
            return Ok(None);
        };
        let offer = compute_offer_range(
            Some(&bundle.parcel),
            DEFAULT_DISCOUNT_LOW,
            DEFAULT_DISCOUNT_HIGH,
        );
        Ok(Some(build_script(&bundle, &offer)))
    }
}

/// Deterministic call script assembled from the lead facts.
fn build_script(bundle: &LeadBundle, offer: &OfferRange) -> String {
    let first_name = bundle.first_name();
    let parcel = &bundle.parcel;
    let acres = parcel
        .lot_size_acres
        .map(|a| format!("{a:.2} acre"))
        .unwrap_or_else(|| "land".into());
    let location = parcel
        .situs_address
        .clone()
        .unwrap_or_else(|| format!("{} Parish", parcel.parish));

    let mut script = format!(
        "OPENING\n\
         \"Hi {first_name}, this is about your {acres} property at {location}. \
         Do you have a quick minute?\"\n\n\
         CONTEXT\n\
         - Motivation score: {}\n\
         - Stage: {}\n",
        bundle.lead.motivation_score,
        bundle.lead.pipeline_stage.as_str(),
    );

    if parcel.is_adjudicated {
        script.push_str("- Property is adjudicated (tax sale). Mention the redemption clock.\n");
    }
    if parcel.years_tax_delinquent > 0 {
        script.push_str(&format!(
            "- {} years of delinquent taxes on record.\n",
            parcel.years_tax_delinquent
        ));
    }

    script.push_str("\nOFFER GUIDANCE\n");
    if offer.can_make_offer {
        script.push_str(&format!(
            "- Open at ${}, walk up to ${} maximum.\n",
            offer.low_offer, offer.high_offer
        ));
        match (offer.price_per_acre_low, offer.price_per_acre_high) {
            (Some(low), Some(high)) => {
                script.push_str(&format!("- That is ${low}-${high} per acre.\n"));
            }
            _ => script.push_str("- Per-acre framing unavailable (no acreage on record).\n"),
        }
    } else {
        script.push_str(
            "- DO NOT quote a number. Assessment data is missing; gather details and \
             schedule a callback.\n",
        );
    }

    script.push_str(
        "\nCLOSING\n\
         \"If we agree on a number, we handle all paperwork and closing costs. \
         What works better for you, earlier or later this week?\"\n",
    );
    script
}
