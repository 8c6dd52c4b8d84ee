//! Conversation engine: inbound message -> lead-state transition,
//! opt-out enforcement, alerting and followup scheduling.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::classifier::{IntentDetection, ReplyClassifier};
use crate::alerts::AlertDispatcher;
use crate::idempotency;
use crate::markets::{self, market_config, MAX_FOLLOWUPS};
use crate::models::{
    AttemptStatus, ConversationIntent, LeadBundle, MessageContext, PipelineStage,
};
use crate::outreach::twilio::{SmsResult, TwilioClient};
use crate::phone;
use crate::store::Store;

/// What processing one inbound message did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InboundOutcome {
    pub matched_lead: Option<i64>,
    pub intent: Option<ConversationIntent>,
    pub replayed: bool,
    pub opted_out: bool,
    pub alerted: bool,
    pub ack_sent: bool,
}

#[derive(Clone)]
pub struct ConversationEngine {
    store: Store,
    classifier: ReplyClassifier,
    twilio: Option<Arc<TwilioClient>>,
    alerts: Arc<AlertDispatcher>,
    dry_run: bool,
}

impl ConversationEngine {
    pub fn new(
        store: Store,
        classifier: ReplyClassifier,
        twilio: Option<Arc<TwilioClient>>,
        alerts: Arc<AlertDispatcher>,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            classifier,
            twilio,
            alerts,
            dry_run,
        }
    }

    /// Process one inbound SMS webhook. Replays (same MessageSid) are
    /// no-ops after the first successful processing.
    pub async fn process_inbound(
        &self,
        message_sid: &str,
        from_number: &str,
        body: &str,
    ) -> Result<InboundOutcome> {
        let mut outcome = InboundOutcome::default();

        if !self
            .store
            .record_inbound_message(message_sid, from_number, body)
            .await?
        {
            info!(sid = message_sid, "inbound webhook replay ignored");
            outcome.replayed = true;
            return Ok(outcome);
        }

        let normalized = phone::normalize_e164(from_number)
            .unwrap_or_else(|| from_number.trim().to_string());
        let Some(lead_id) = self.store.find_lead_by_owner_phone(&normalized).await? else {
            warn!(from = %normalized, "inbound sms from unknown number");
            return Ok(outcome);
        };
        outcome.matched_lead = Some(lead_id);

        let Some(bundle) = self.store.get_lead_bundle(lead_id).await? else {
            return Ok(outcome);
        };

        let detection = self.classifier.classify(body).await;
        outcome.intent = Some(detection.intent);
        info!(
            lead_id,
            intent = detection.intent.as_str(),
            confidence = detection.confidence,
            "inbound reply classified"
        );

        // Attach the reply to the latest outbound attempt.
        let now = Utc::now();
        if let Some(attempt) = self.store.latest_attempt_for_lead(lead_id).await? {
            self.store
                .record_attempt_response(
                    attempt.id,
                    body,
                    now,
                    detection.intent.lead_classification(),
                )
                .await?;
        }

        self.store
            .append_timeline_event(
                lead_id,
                "message_received",
                &format!("Reply received: {}", detection.intent.as_str()),
                Some(&truncate(body, 200)),
                Some(&serde_json::json!({
                    "intent": detection.intent.as_str(),
                    "confidence": detection.confidence,
                    "sentiment": detection.sentiment,
                    "keywords": detection.keywords,
                })),
            )
            .await?;

        if detection.intent.is_stop_class() {
            self.handle_stop_class(&bundle, &detection, &mut outcome)
                .await?;
            return Ok(outcome);
        }

        self.handle_conversational(&bundle, &detection, &mut outcome)
            .await?;
        Ok(outcome)
    }

    /// STOP / DECEASED / WRONG_NUMBER: permanent opt-out, stage
    /// CONTACTED, classification DEAD, followups cancelled, one
    /// acknowledgement message.
    async fn handle_stop_class(
        &self,
        bundle: &LeadBundle,
        detection: &IntentDetection,
        outcome: &mut InboundOutcome,
    ) -> Result<()> {
        let lead_id = bundle.lead.id;
        let now = Utc::now();

        self.store
            .mark_owner_opted_out(bundle.owner.id, now)
            .await?;
        outcome.opted_out = true;

        self.store
            .apply_reply_update(
                lead_id,
                crate::models::ReplyClassification::Dead,
                Some(PipelineStage::Contacted),
                now,
                bundle.lead.followup_count + 1,
                now,
                None,
            )
            .await?;

        let status = match detection.intent {
            ConversationIntent::Deceased => "deceased",
            ConversationIntent::WrongNumber => "wrong_number",
            _ => "opted_out",
        };
        self.store.set_lead_status(lead_id, status).await?;

        self.store
            .append_timeline_event(
                lead_id,
                "opt_out",
                &format!("{} received, owner opted out", detection.intent.as_str()),
                None,
                None,
            )
            .await?;

        outcome.ack_sent = self
            .send_acknowledgement(bundle, detection.intent)
            .await?;
        Ok(())
    }

    /// Everything that is not a stop-class intent.
    async fn handle_conversational(
        &self,
        bundle: &LeadBundle,
        detection: &IntentDetection,
        outcome: &mut InboundOutcome,
    ) -> Result<()> {
        let lead_id = bundle.lead.id;
        let now = Utc::now();
        let classification = detection.intent.lead_classification();
        let followup_count = bundle.lead.followup_count + 1;

        let (stage, next_followup) = match detection.intent {
            ConversationIntent::NotInterested => {
                // Long cool-off; the gate blocks sends either way.
                (Some(PipelineStage::Contacted), Some(now + Duration::days(30)))
            }
            ConversationIntent::Interested | ConversationIntent::AskingPrice => {
                let market = market_config(&bundle.lead.market_code);
                (
                    Some(PipelineStage::Hot),
                    Some(now + Duration::days(market.followup_day_1)),
                )
            }
            _ => {
                // Interval table indexed by followup count, capped.
                let next = if bundle.lead.followup_count >= MAX_FOLLOWUPS {
                    None
                } else {
                    Some(
                        now + Duration::days(markets::followup_interval_days(
                            bundle.lead.followup_count,
                        )),
                    )
                };
                (None, next)
            }
        };

        self.store
            .apply_reply_update(
                lead_id,
                classification,
                stage,
                now,
                followup_count,
                now,
                next_followup,
            )
            .await?;

        if matches!(
            detection.intent,
            ConversationIntent::Interested | ConversationIntent::AskingPrice
        ) {
            let reason = match detection.intent {
                ConversationIntent::AskingPrice => "seller asking for price",
                _ => "seller expressed interest",
            };
            outcome.alerted = self.alerts.alert_hot_lead(lead_id, reason).await?;
        }

        Ok(())
    }

    /// Compliance acknowledgement. Recorded as an attempt with the
    /// `ack` context so one exists at most once per lead per day.
    async fn send_acknowledgement(
        &self,
        bundle: &LeadBundle,
        intent: ConversationIntent,
    ) -> Result<bool> {
        let lead_id = bundle.lead.id;
        let body = match intent {
            ConversationIntent::Deceased => {
                "We apologize for the inconvenience. Our condolences; you will not hear from us again."
            }
            ConversationIntent::WrongNumber => {
                "Apologies for the confusion. We'll remove this number from our list."
            }
            _ => "You have been unsubscribed and will not receive further messages.",
        };

        let key = idempotency::outreach_key(
            lead_id,
            MessageContext::Ack,
            &idempotency::date_key(Utc::now()),
        );
        let Some(attempt) = self
            .store
            .reserve_attempt(lead_id, &key, "sms", MessageContext::Ack)
            .await?
        else {
            return Ok(false);
        };

        if self.dry_run {
            self.store
                .finalize_attempt(
                    attempt.id,
                    AttemptStatus::DryRun,
                    "dry_run",
                    Some(body),
                    Some("dry_run"),
                    None,
                    None,
                )
                .await?;
            return Ok(true);
        }

        let Some(twilio) = self.twilio.as_deref() else {
            self.store
                .finalize_attempt(
                    attempt.id,
                    AttemptStatus::Failed,
                    "not_configured",
                    Some(body),
                    None,
                    Some("sms gateway not configured"),
                    None,
                )
                .await?;
            return Ok(false);
        };

        // The acknowledgement goes to the number that just texted us;
        // the opt-out that was set above blocks all future sends.
        let to = bundle
            .owner
            .phone_primary
            .clone()
            .unwrap_or_default();
        match twilio.send_sms(&to, body).await {
            Ok(SmsResult::Accepted { sid, .. }) => {
                self.store
                    .finalize_attempt(
                        attempt.id,
                        AttemptStatus::Sent,
                        "sent",
                        Some(body),
                        Some(&sid),
                        None,
                        Some(Utc::now()),
                    )
                    .await?;
                Ok(true)
            }
            Ok(SmsResult::Rejected { message, .. }) => {
                self.store
                    .finalize_attempt(
                        attempt.id,
                        AttemptStatus::Failed,
                        "twilio_error",
                        Some(body),
                        None,
                        Some(&message),
                        None,
                    )
                    .await?;
                Ok(false)
            }
            Err(e) => {
                self.store
                    .finalize_attempt(
                        attempt.id,
                        AttemptStatus::Failed,
                        "error",
                        Some(body),
                        None,
                        Some(&format!("{e:#}")),
                        None,
                    )
                    .await?;
                Ok(false)
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
