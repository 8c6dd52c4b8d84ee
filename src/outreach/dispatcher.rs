//! Outreach dispatcher: the single chokepoint for outbound messages.
//!
//! Order of operations is fixed: TCPA gate, send lock, idempotency
//! reservation, message generation, rate limit + circuit check,
//! gateway call, result mapping, lead update. A blocked send records
//! nothing; everything past the reservation records an attempt row.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::message;
use super::twilio::{
    SmsResult, TwilioClient, ERR_AUTH, ERR_BLACKLISTED, ERR_GEO_RESTRICTED, ERR_INVALID_NUMBER,
    ERR_INVALID_TO_NUMBER, ERR_RATE_LIMITED, ERR_UNVERIFIED_RECIPIENT,
};
use super::validator::{validate_can_send, SendBlocked};
use crate::idempotency::{self, IdempotencyService, Reservation};
use crate::llm::LlmClient;
use crate::locks::SendLockService;
use crate::models::{AttemptStatus, LeadBundle, MessageContext, OutreachAttempt};
use crate::resilience::{CircuitBreaker, RateLimiter};
use crate::store::Store;

/// Longest a dispatch will sleep on the rate limiter.
const MAX_RATE_WAIT: Duration = Duration::from_secs(5);

/// Outcome of one dispatch call.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// No such lead.
    NotFound,
    /// TCPA gate refused; nothing was recorded.
    Blocked(SendBlocked),
    /// Another worker holds the send lock.
    Locked,
    /// The (lead, context, day) slot was already used.
    Duplicate(OutreachAttempt),
    /// An attempt row was written (sent, dry_run, or a mapped failure).
    Completed(OutreachAttempt),
}

impl DispatchOutcome {
    /// True when a message actually went out (or would have, dry-run).
    pub fn is_send(&self) -> bool {
        matches!(
            self,
            Self::Completed(attempt)
                if matches!(attempt.status, AttemptStatus::Sent | AttemptStatus::DryRun)
        )
    }
}

#[derive(Clone)]
pub struct OutreachDispatcher {
    store: Store,
    send_locks: SendLockService,
    idempotency: IdempotencyService,
    twilio: Option<Arc<TwilioClient>>,
    llm: Option<Arc<LlmClient>>,
    llm_circuit: CircuitBreaker,
    gateway_circuit: CircuitBreaker,
    rate_limiter: RateLimiter,
    dry_run: bool,
}

impl OutreachDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        send_locks: SendLockService,
        twilio: Option<Arc<TwilioClient>>,
        llm: Option<Arc<LlmClient>>,
        llm_circuit: CircuitBreaker,
        gateway_circuit: CircuitBreaker,
        rate_limiter: RateLimiter,
        dry_run: bool,
    ) -> Self {
        Self {
            idempotency: IdempotencyService::new(store.clone()),
            store,
            send_locks,
            twilio,
            llm,
            llm_circuit,
            gateway_circuit,
            rate_limiter,
            dry_run,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Copy of this dispatcher forced into dry-run mode (per-request
    /// dry runs against a live configuration).
    pub fn as_dry_run(&self) -> Self {
        let mut copy = self.clone();
        copy.dry_run = true;
        copy
    }

    /// Dispatch one message to a lead.
    pub async fn dispatch(
        &self,
        lead_id: i64,
        context: MessageContext,
        override_body: Option<String>,
        force: bool,
    ) -> Result<DispatchOutcome> {
        let Some(bundle) = self.store.get_lead_bundle(lead_id).await? else {
            return Ok(DispatchOutcome::NotFound);
        };

        // TCPA gate first: a refusal records nothing.
        let to_number = match validate_can_send(&bundle.owner, &bundle.lead, force) {
            Ok(number) => number,
            Err(blocked) => {
                info!(
                    lead_id,
                    code = blocked.code.as_str(),
                    "send blocked by gate"
                );
                return Ok(DispatchOutcome::Blocked(blocked));
            }
        };

        // Exclusive send rights on this lead.
        if !self.send_locks.acquire(lead_id).await? {
            return Ok(DispatchOutcome::Locked);
        }
        let outcome = self
            .dispatch_locked(&bundle, context, override_body, &to_number)
            .await;
        if let Err(e) = self.send_locks.release(lead_id).await {
            warn!(lead_id, error = %e, "send lock release failed");
        }
        outcome
    }

    async fn dispatch_locked(
        &self,
        bundle: &LeadBundle,
        context: MessageContext,
        override_body: Option<String>,
        to_number: &str,
    ) -> Result<DispatchOutcome> {
        let lead_id = bundle.lead.id;

        // Reserve the (lead, context, day) idempotency slot.
        let key = idempotency::outreach_key(lead_id, context, &idempotency::date_key(Utc::now()));
        let attempt = match self
            .idempotency
            .reserve(lead_id, &key, "sms", context)
            .await?
        {
            Reservation::Reserved(attempt) => attempt,
            Reservation::Duplicate(existing) => {
                info!(lead_id, context = context.as_str(), "duplicate send prevented");
                return Ok(DispatchOutcome::Duplicate(existing));
            }
        };

        // Message body: explicit override, else LLM with template
        // fallback.
        let body = match override_body {
            Some(body) => message::clamp_sms(&body),
            None => {
                message::generate_message(
                    self.llm.as_deref(),
                    &self.llm_circuit,
                    context,
                    &bundle.first_name(),
                    &bundle.parcel.parish,
                    bundle.parcel.lot_size_acres,
                )
                .await
            }
        };

        if self.dry_run {
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
            info!(lead_id, "[dry run] sms suppressed");
            let attempt = self.reload(attempt.id).await?;
            return Ok(DispatchOutcome::Completed(attempt));
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
            return Err(anyhow!("live send requested but twilio is not configured"));
        };

        // Token bucket bounds gateway throughput.
        self.rate_limiter.acquire(MAX_RATE_WAIT).await;

        // Circuit short-circuits before any gateway traffic.
        if !self.gateway_circuit.can_execute() {
            warn!(lead_id, "gateway circuit open, send short-circuited");
            self.store
                .finalize_attempt(
                    attempt.id,
                    AttemptStatus::Failed,
                    "circuit_open",
                    Some(&body),
                    None,
                    Some("sms gateway circuit open"),
                    None,
                )
                .await?;
            let attempt = self.reload(attempt.id).await?;
            return Ok(DispatchOutcome::Completed(attempt));
        }

        let send_result = twilio.send_sms(to_number, &body).await;
        self.apply_gateway_result(bundle, attempt, &body, send_result)
            .await
    }

    /// Map the gateway outcome onto attempt status/result, update lead
    /// state, and decide what propagates to the caller.
    async fn apply_gateway_result(
        &self,
        bundle: &LeadBundle,
        attempt: OutreachAttempt,
        body: &str,
        send_result: Result<SmsResult>,
    ) -> Result<DispatchOutcome> {
        let lead_id = bundle.lead.id;

        let result = match send_result {
            Ok(result) => result,
            Err(e) => {
                // Transport failure after retries: record, then raise.
                self.gateway_circuit.record_failure();
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
                return Err(e.context("sms gateway call failed"));
            }
        };

        match result {
            SmsResult::Accepted {
                sid,
                status,
                error_code,
                error_message,
            } => {
                self.gateway_circuit.record_success();

                if let Some(code) = error_code {
                    // Accepted but flagged: record the error, no raise.
                    let detail = error_message
                        .unwrap_or_else(|| format!("twilio error code {code}"));
                    warn!(lead_id, sid = %sid, code, "twilio accepted with error");
                    self.store
                        .finalize_attempt(
                            attempt.id,
                            AttemptStatus::Failed,
                            "twilio_error",
                            Some(body),
                            Some(&sid),
                            Some(&detail),
                            None,
                        )
                        .await?;
                } else if matches!(status.as_str(), "failed" | "undelivered") {
                    self.store
                        .finalize_attempt(
                            attempt.id,
                            AttemptStatus::Failed,
                            "delivery_failed",
                            Some(body),
                            Some(&sid),
                            Some(&format!("twilio status: {status}")),
                            None,
                        )
                        .await?;
                } else {
                    let now = Utc::now();
                    self.store
                        .finalize_attempt(
                            attempt.id,
                            AttemptStatus::Sent,
                            "sent",
                            Some(body),
                            Some(&sid),
                            None,
                            Some(now),
                        )
                        .await?;
                    self.store.mark_lead_contacted(lead_id).await?;
                    self.store
                        .append_timeline_event(
                            lead_id,
                            "message_sent",
                            &format!("{} SMS sent", attempt.message_context.as_str()),
                            Some(body),
                            Some(&serde_json::json!({ "sid": sid })),
                        )
                        .await?;
                    info!(lead_id, sid = %sid, "sms sent");
                }

                let attempt = self.reload(attempt.id).await?;
                Ok(DispatchOutcome::Completed(attempt))
            }
            SmsResult::Rejected {
                code,
                message,
                http_status,
            } => {
                self.gateway_circuit.record_failure();
                let (result_label, raise) = match code {
                    Some(ERR_INVALID_NUMBER) => ("invalid_number", false),
                    Some(ERR_GEO_RESTRICTED) => ("geo_restricted", false),
                    Some(ERR_BLACKLISTED) => ("blacklisted", false),
                    Some(ERR_INVALID_TO_NUMBER) => ("invalid_to_number", false),
                    Some(ERR_UNVERIFIED_RECIPIENT) => ("unverified_recipient", true),
                    Some(ERR_AUTH) => ("auth_error", true),
                    Some(ERR_RATE_LIMITED) | Some(429) => ("rate_limited", true),
                    _ => ("twilio_error", true),
                };
                warn!(
                    lead_id,
                    code,
                    http_status,
                    result = result_label,
                    "twilio rejected send"
                );

                self.store
                    .finalize_attempt(
                        attempt.id,
                        AttemptStatus::Failed,
                        result_label,
                        Some(body),
                        None,
                        Some(&message),
                        None,
                    )
                    .await?;

                if raise {
                    return Err(anyhow!(
                        "twilio {result_label} (code {code:?}): {message}"
                    ));
                }
                let attempt = self.reload(attempt.id).await?;
                Ok(DispatchOutcome::Completed(attempt))
            }
        }
    }

    async fn reload(&self, attempt_id: i64) -> Result<OutreachAttempt> {
        self.store
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| anyhow!("attempt {attempt_id} vanished"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PipelineStage;
    use crate::store::testutil::temp_store;
    use crate::store::IngestParcel;

    async fn seed_lead(store: &Store, phone: Option<&str>) -> i64 {
        let (parcel_id, _) = store
            .upsert_parcel(&IngestParcel {
                canonical_parcel_id: "D1".into(),
                parish: "East Baton Rouge".into(),
                market_code: "LA".into(),
                lot_size_acres: Some(2.0),
                ..Default::default()
            })
            .await
            .unwrap();
        let (party_id, _) = store
            .upsert_party("hd", "JOHN DOE", "70801", "John Doe", None, "LA")
            .await
            .unwrap();
        let (owner_id, _) = store
            .ensure_owner(party_id, phone, None, phone.is_some())
            .await
            .unwrap();
        store.upsert_lead(owner_id, parcel_id, "LA").await.unwrap().0
    }

    fn dispatcher(store: &Store, dry_run: bool) -> OutreachDispatcher {
        OutreachDispatcher::new(
            store.clone(),
            SendLockService::new(store.clone()),
            None,
            None,
            CircuitBreaker::new("llm", 3, Duration::from_secs(60)),
            CircuitBreaker::new("twilio", 5, Duration::from_secs(60)),
            RateLimiter::per_second("twilio", 10.0),
            dry_run,
        )
    }

    #[tokio::test]
    async fn opt_out_records_nothing() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store, Some("+12255550147")).await;
        let lead = store.get_lead(lead_id).await.unwrap().unwrap();
        store
            .mark_owner_opted_out(lead.owner_id, Utc::now())
            .await
            .unwrap();

        let d = dispatcher(&store, true);
        let outcome = d
            .dispatch(lead_id, MessageContext::Intro, None, false)
            .await
            .unwrap();

        match outcome {
            DispatchOutcome::Blocked(blocked) => {
                assert_eq!(blocked.code.as_str(), "OPT_OUT");
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
        // No attempt row was written.
        let counts = store.entity_counts().await.unwrap();
        assert_eq!(counts.outreach_attempts, 0);
    }

    #[tokio::test]
    async fn dry_run_records_attempt_without_gateway() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store, Some("+12255550147")).await;

        let d = dispatcher(&store, true);
        let outcome = d
            .dispatch(lead_id, MessageContext::Intro, None, false)
            .await
            .unwrap();

        let DispatchOutcome::Completed(attempt) = outcome else {
            panic!("expected Completed");
        };
        assert_eq!(attempt.status, AttemptStatus::DryRun);
        assert_eq!(attempt.result.as_deref(), Some("dry_run"));
        assert_eq!(attempt.external_id.as_deref(), Some("dry_run"));
        assert!(attempt.message_body.is_some());
    }

    #[tokio::test]
    async fn same_day_repeat_is_duplicate() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store, Some("+12255550147")).await;

        let d = dispatcher(&store, true);
        let first = d
            .dispatch(lead_id, MessageContext::Followup, None, false)
            .await
            .unwrap();
        let first_id = match first {
            DispatchOutcome::Completed(a) => a.id,
            other => panic!("expected Completed, got {other:?}"),
        };

        let second = d
            .dispatch(lead_id, MessageContext::Followup, None, false)
            .await
            .unwrap();
        match second {
            DispatchOutcome::Duplicate(a) => assert_eq!(a.id, first_id),
            other => panic!("expected Duplicate, got {other:?}"),
        }

        let counts = store.entity_counts().await.unwrap();
        assert_eq!(counts.outreach_attempts, 1);
    }

    #[tokio::test]
    async fn lock_contention_reported() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store, Some("+12255550147")).await;

        // Another instance holds the lock.
        let other = SendLockService::new(store.clone());
        assert!(other.acquire(lead_id).await.unwrap());

        let d = dispatcher(&store, true);
        let outcome = d
            .dispatch(lead_id, MessageContext::Intro, None, false)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Locked));
    }

    #[tokio::test]
    async fn missing_lead_is_not_found() {
        let (store, _file) = temp_store();
        let d = dispatcher(&store, true);
        let outcome = d
            .dispatch(9999, MessageContext::Intro, None, false)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::NotFound));
    }

    #[tokio::test]
    async fn dry_run_does_not_advance_stage() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store, Some("+12255550147")).await;

        let d = dispatcher(&store, true);
        d.dispatch(lead_id, MessageContext::Intro, None, false)
            .await
            .unwrap();

        let lead = store.get_lead(lead_id).await.unwrap().unwrap();
        assert_eq!(lead.pipeline_stage, PipelineStage::New);
    }
}
