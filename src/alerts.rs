//! Hot-lead alerting with per-lead deduplication.
//!
//! Sinks are per-market (SMS numbers and/or a Slack webhook). A lead
//! is marked alerted only when at least one sink succeeded, so a
//! fully-failed alert retries on the next pass.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

use crate::markets::market_config;
use crate::models::AlertConfig;
use crate::outreach::twilio::TwilioClient;
use crate::resilience::{CircuitBreaker, RateLimiter};
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertRunStats {
    pub candidates: usize,
    pub sent: usize,
    pub deduped: usize,
    pub rate_limited: usize,
    pub failed: usize,
    /// Candidates left unalerted because the market has no sinks.
    pub no_sinks: usize,
}

#[derive(Clone)]
pub struct AlertDispatcher {
    store: Store,
    http: reqwest::Client,
    twilio: Option<Arc<TwilioClient>>,
    twilio_circuit: CircuitBreaker,
    slack_circuit: CircuitBreaker,
    rate_limiter: RateLimiter,
    default_dedup_hours: i64,
    dry_run: bool,
}

impl AlertDispatcher {
    pub fn new(
        store: Store,
        http: reqwest::Client,
        twilio: Option<Arc<TwilioClient>>,
        default_dedup_hours: i64,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            http,
            twilio,
            twilio_circuit: CircuitBreaker::new("alert_sms", 3, StdDuration::from_secs(300)),
            slack_circuit: CircuitBreaker::new("alert_slack", 3, StdDuration::from_secs(300)),
            // Alerts are capped fleet-wide at 10 per minute.
            rate_limiter: RateLimiter::new("alerts", 10, StdDuration::from_secs(60)),
            default_dedup_hours,
            dry_run,
        }
    }

    fn effective_config(&self, market: &str, stored: Option<AlertConfig>) -> AlertConfig {
        stored.unwrap_or_else(|| {
            let m = market_config(market);
            AlertConfig {
                market_code: m.code.to_string(),
                enabled: m.alerts_enabled,
                hot_score_threshold: m.hot_score_threshold,
                sms_numbers: Vec::new(),
                slack_webhook_url: None,
                dedup_hours: self.default_dedup_hours,
            }
        })
    }

    /// Alert every HOT lead in a market that clears the threshold and
    /// the dedup window.
    pub async fn run_hot_alerts(&self, market: &str) -> Result<AlertRunStats> {
        let stored = self.store.get_alert_config(market).await?;
        let config = self.effective_config(market, stored);
        let mut stats = AlertRunStats::default();

        if !config.enabled {
            return Ok(stats);
        }

        let lead_ids = self
            .store
            .hot_leads_for_alerts(market, config.hot_score_threshold, 200)
            .await?;
        stats.candidates = lead_ids.len();

        for lead_id in lead_ids {
            match self.alert_lead(lead_id, &config, "hot lead").await? {
                AlertOutcome::Sent => stats.sent += 1,
                AlertOutcome::Deduped => stats.deduped += 1,
                AlertOutcome::RateLimited => stats.rate_limited += 1,
                AlertOutcome::Failed => stats.failed += 1,
                AlertOutcome::NoSinks => stats.no_sinks += 1,
            }
        }

        // One warning per pass, not one per lead.
        if stats.no_sinks > 0 {
            warn!(
                market,
                leads = stats.no_sinks,
                "no alert sinks configured, hot leads not alerted"
            );
        }

        info!(
            market,
            sent = stats.sent,
            deduped = stats.deduped,
            "hot-lead alert pass complete"
        );
        Ok(stats)
    }

    /// Immediate alert for one lead (interested-reply path).
    pub async fn alert_hot_lead(&self, lead_id: i64, reason: &str) -> Result<bool> {
        let Some(lead) = self.store.get_lead(lead_id).await? else {
            return Ok(false);
        };
        let stored = self.store.get_alert_config(&lead.market_code).await?;
        let config = self.effective_config(&lead.market_code, stored);
        if !config.enabled {
            return Ok(false);
        }
        Ok(matches!(
            self.alert_lead(lead_id, &config, reason).await?,
            AlertOutcome::Sent
        ))
    }

    async fn alert_lead(
        &self,
        lead_id: i64,
        config: &AlertConfig,
        reason: &str,
    ) -> Result<AlertOutcome> {
        let Some(lead) = self.store.get_lead(lead_id).await? else {
            return Ok(AlertOutcome::Failed);
        };

        // No sinks means no delivery: the lead stays unalerted so a
        // later sink configuration picks it up on the next pass.
        if config.sms_numbers.is_empty() && config.slack_webhook_url.is_none() {
            return Ok(AlertOutcome::NoSinks);
        }

        // Per-lead dedup window.
        let dedup_hours = if config.dedup_hours > 0 {
            config.dedup_hours
        } else {
            self.default_dedup_hours
        };
        if let Some(last) = lead.last_alerted_at {
            if Utc::now() - last < Duration::hours(dedup_hours) {
                return Ok(AlertOutcome::Deduped);
            }
        }

        if !self.rate_limiter.can_proceed() {
            warn!(lead_id, "alert rate limit reached");
            return Ok(AlertOutcome::RateLimited);
        }

        let message = format!(
            "🔥 {} in {}: lead #{} score {} ({})",
            reason.to_uppercase(),
            lead.market_code,
            lead.id,
            lead.motivation_score,
            lead.pipeline_stage.as_str(),
        );

        let mut any_success = false;
        for number in &config.sms_numbers {
            if self.send_sms_alert(number, &message).await {
                any_success = true;
            }
        }
        if let Some(webhook) = &config.slack_webhook_url {
            if self.send_slack_alert(webhook, &message).await {
                any_success = true;
            }
        }

        // last_alerted_at moves only when at least one sink succeeded.
        if any_success {
            self.rate_limiter.record_call();
            self.store.mark_lead_alerted(lead_id, Utc::now()).await?;
            self.store
                .append_timeline_event(
                    lead_id,
                    "alert_sent",
                    reason,
                    Some(&message),
                    None,
                )
                .await?;
            Ok(AlertOutcome::Sent)
        } else {
            Ok(AlertOutcome::Failed)
        }
    }

    async fn send_sms_alert(&self, to: &str, message: &str) -> bool {
        if self.dry_run {
            info!(to, "[dry run] sms alert suppressed");
            return true;
        }
        let Some(twilio) = self.twilio.as_deref() else {
            warn!("sms alert sink configured but twilio is not");
            return false;
        };
        if !self.twilio_circuit.can_execute() {
            warn!("alert sms circuit open");
            return false;
        }

        match twilio.send_sms(to, message).await {
            Ok(crate::outreach::twilio::SmsResult::Accepted { .. }) => {
                self.twilio_circuit.record_success();
                true
            }
            Ok(crate::outreach::twilio::SmsResult::Rejected { code, message, .. }) => {
                self.twilio_circuit.record_failure();
                warn!(?code, %message, "alert sms rejected");
                false
            }
            Err(e) => {
                self.twilio_circuit.record_failure();
                warn!(error = %e, "alert sms failed");
                false
            }
        }
    }

    async fn send_slack_alert(&self, webhook_url: &str, message: &str) -> bool {
        if self.dry_run {
            info!("[dry run] slack alert suppressed");
            return true;
        }
        if !self.slack_circuit.can_execute() {
            warn!("alert slack circuit open");
            return false;
        }

        let result = self
            .http
            .post(webhook_url)
            .timeout(StdDuration::from_secs(10))
            .json(&serde_json::json!({ "text": message }))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                self.slack_circuit.record_success();
                true
            }
            Ok(resp) => {
                self.slack_circuit.record_failure();
                warn!(status = resp.status().as_u16(), "slack alert rejected");
                false
            }
            Err(e) => {
                self.slack_circuit.record_failure();
                warn!(error = %e, "slack alert failed");
                false
            }
        }
    }
}

enum AlertOutcome {
    Sent,
    Deduped,
    RateLimited,
    Failed,
    NoSinks,
}
