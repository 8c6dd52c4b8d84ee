//! Application state: the composition root.
//!
//! Every client, breaker and limiter is constructed here once and
//! handed to the components that need it. No module globals.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::alerts::AlertDispatcher;
use crate::buyers::{BuyerBlastService, BuyerMatcher, CallPrepService, DealSheetService};
use crate::config::Config;
use crate::enrichment::EnrichmentService;
use crate::followup::FollowupScheduler;
use crate::llm::LlmClient;
use crate::locks::{SchedulerLockService, SendLockService};
use crate::outreach::twilio::TwilioClient;
use crate::outreach::OutreachDispatcher;
use crate::pipeline::NightlyPipeline;
use crate::replies::{ConversationEngine, ReplyClassifier};
use crate::resilience::{CircuitBreaker, RateLimiter};
use crate::scoring::ScoringEngine;
use crate::store::Store;

/// Shared application state, cloned into handlers and loops.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub dispatcher: Arc<OutreachDispatcher>,
    pub conversation: Arc<ConversationEngine>,
    pub alerts: Arc<AlertDispatcher>,
    pub scoring: Arc<ScoringEngine>,
    pub followups: FollowupScheduler,
    pub pipeline: NightlyPipeline,
    pub call_prep: CallPrepService,
    pub deal_sheets: DealSheetService,
    pub blast: BuyerBlastService,
    pub enrichment: Arc<EnrichmentService>,
    pub twilio: Option<Arc<TwilioClient>>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn build(
        config: Arc<Config>,
        store: Store,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .context("build http client")?;

        let twilio = if config.twilio_configured() {
            let sid = config.twilio_account_sid.clone().unwrap_or_default();
            let token = config.twilio_auth_token.clone().unwrap_or_default();
            Some(Arc::new(TwilioClient::new(
                http.clone(),
                sid,
                token,
                config.twilio_from_number.clone(),
                config.twilio_messaging_service_sid.clone(),
                config.twilio_status_callback_url.clone(),
            )?))
        } else {
            info!("twilio not configured, sends limited to dry-run");
            None
        };

        let llm = match config.openrouter_api_key.clone() {
            Some(key) => Some(Arc::new(LlmClient::new(
                http.clone(),
                key,
                config.llm_model.clone(),
            )?)),
            None => {
                info!("llm not configured, deterministic fallbacks only");
                None
            }
        };

        let send_locks = SendLockService::new(store.clone());
        let scheduler_locks = SchedulerLockService::new(store.clone());

        let dispatcher = Arc::new(OutreachDispatcher::new(
            store.clone(),
            send_locks,
            twilio.clone(),
            llm.clone(),
            CircuitBreaker::new("message_llm", 3, Duration::from_secs(120)),
            CircuitBreaker::new("twilio", 5, Duration::from_secs(60)),
            RateLimiter::per_second("twilio", config.twilio_max_messages_per_second),
            config.dry_run,
        ));

        let alerts = Arc::new(AlertDispatcher::new(
            store.clone(),
            http.clone(),
            twilio.clone(),
            config.alert_dedup_hours,
            config.dry_run,
        ));

        let classifier = ReplyClassifier::new(
            llm.clone(),
            CircuitBreaker::new("reply_classifier_llm", 3, Duration::from_secs(120)),
        );
        let conversation = Arc::new(ConversationEngine::new(
            store.clone(),
            classifier,
            twilio.clone(),
            alerts.clone(),
            config.dry_run,
        ));

        let scoring = Arc::new(ScoringEngine::new(
            store.clone(),
            config.weights.clone(),
            config.thresholds,
        ));
        let followups = FollowupScheduler::new(store.clone(), dispatcher.clone());

        let deal_sheets = DealSheetService::new(
            store.clone(),
            llm,
            config.retail_multiplier,
            config.enable_comps,
        );
        let blast = BuyerBlastService::new(
            store.clone(),
            BuyerMatcher::new(store.clone()),
            deal_sheets.clone(),
            twilio.clone(),
            config.dry_run,
        );
        let call_prep = CallPrepService::new(store.clone());
        let enrichment = Arc::new(EnrichmentService::from_config(&config));

        let pipeline = NightlyPipeline::new(
            store.clone(),
            config.clone(),
            scoring.clone(),
            dispatcher.clone(),
            followups.clone(),
            alerts.clone(),
            enrichment.clone(),
            scheduler_locks,
            shutdown.clone(),
        );

        Ok(Self {
            config,
            store,
            dispatcher,
            conversation,
            alerts,
            scoring,
            followups,
            pipeline,
            call_prep,
            deal_sheets,
            blast,
            enrichment,
            twilio,
            shutdown,
        })
    }
}
