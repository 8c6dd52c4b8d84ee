//! Nightly orchestrator: single-writer pipeline per market.
//!
//! Guarded by the cluster-wide `nightly_pipeline` lock and wrapped in
//! a BackgroundTask record. Steps run sequentially per market; a step
//! failure is recorded and the remaining steps still run. Cancellation
//! is cooperative: the in-flight step completes, the rest are skipped.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertDispatcher, AlertRunStats};
use crate::config::Config;
use crate::enrichment::EnrichmentService;
use crate::followup::{FollowupRunStats, FollowupScheduler};
use crate::ingest::{self, IngestionStats};
use crate::locks::SchedulerLockService;
use crate::markets::market_config;
use crate::models::MessageContext;
use crate::outreach::{DispatchOutcome, OutreachDispatcher};
use crate::phone;
use crate::scoring::{ScoringEngine, ScoringRunStats};
use crate::store::Store;

pub const NIGHTLY_LOCK_NAME: &str = "nightly_pipeline";
const NIGHTLY_LOCK_TTL_SECS: i64 = 3600;

/// Dispatch workers per outreach batch.
const OUTREACH_WORKERS: usize = 4;

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutreachRunStats {
    pub candidates: usize,
    pub sent: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub failed: usize,
    pub halted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentStats {
    pub examined: usize,
    pub phones_normalized: usize,
    pub marked_tcpa_safe: usize,
    pub addresses_standardized: usize,
    pub geocoded: usize,
    pub assessments_backfilled: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketReport {
    pub market: String,
    pub ingestion: Option<IngestionStats>,
    pub enrichment: Option<EnrichmentStats>,
    pub scoring: Option<ScoringRunStats>,
    pub outreach: Option<OutreachRunStats>,
    pub followups: Option<FollowupRunStats>,
    pub alerts: Option<AlertRunStats>,
    pub step_errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub task_id: String,
    pub markets: Vec<MarketReport>,
    pub cancelled: bool,
    pub dry_run: bool,
}

/// Pipeline invocation outcome.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Another instance holds the nightly lock.
    LockNotAcquired,
    Completed(PipelineReport),
}

#[derive(Clone)]
pub struct NightlyPipeline {
    store: Store,
    config: Arc<Config>,
    scoring: Arc<ScoringEngine>,
    dispatcher: Arc<OutreachDispatcher>,
    followups: FollowupScheduler,
    alerts: Arc<AlertDispatcher>,
    enrichment: Arc<EnrichmentService>,
    scheduler_locks: SchedulerLockService,
    cancel: watch::Receiver<bool>,
}

impl NightlyPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        config: Arc<Config>,
        scoring: Arc<ScoringEngine>,
        dispatcher: Arc<OutreachDispatcher>,
        followups: FollowupScheduler,
        alerts: Arc<AlertDispatcher>,
        enrichment: Arc<EnrichmentService>,
        scheduler_locks: SchedulerLockService,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            scoring,
            dispatcher,
            followups,
            alerts,
            enrichment,
            scheduler_locks,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Run the full pipeline over the given markets.
    pub async fn run(&self, markets: Vec<String>, dry_run: bool) -> Result<PipelineOutcome> {
        if !self
            .scheduler_locks
            .acquire(NIGHTLY_LOCK_NAME, Duration::seconds(NIGHTLY_LOCK_TTL_SECS))
            .await?
        {
            return Ok(PipelineOutcome::LockNotAcquired);
        }

        let task_id = Uuid::new_v4().to_string();
        let params = serde_json::json!({ "markets": markets, "dry_run": dry_run });
        self.store
            .create_task(&task_id, "nightly_pipeline", None, Some(&params))
            .await?;
        self.store.mark_task_running(&task_id).await?;
        info!(task_id = %task_id, ?markets, dry_run, "nightly pipeline started");

        let run_result = self.run_markets(&markets, dry_run).await;

        let outcome = match run_result {
            Ok(mut report) => {
                report.task_id = task_id.clone();
                report.dry_run = dry_run;
                let result_json = serde_json::to_value(&report)?;
                if report.cancelled {
                    self.store
                        .mark_task_cancelled(&task_id, "shutdown signal", Some(&result_json))
                        .await?;
                } else {
                    self.store
                        .mark_task_completed(&task_id, &result_json)
                        .await?;
                }
                Ok(PipelineOutcome::Completed(report))
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "nightly pipeline failed");
                self.store
                    .mark_task_failed(&task_id, &format!("{e:#}"), None)
                    .await?;
                Err(e)
            }
        };

        if let Err(e) = self.scheduler_locks.release(NIGHTLY_LOCK_NAME).await {
            warn!(error = %e, "nightly lock release failed");
        }
        outcome
    }

    async fn run_markets(&self, markets: &[String], dry_run: bool) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();

        // Per-request dry runs use a dry-run copy of the dispatcher.
        let dispatcher = if dry_run && !self.dispatcher.dry_run() {
            Arc::new(self.dispatcher.as_dry_run())
        } else {
            self.dispatcher.clone()
        };
        let followups = if dry_run && !self.dispatcher.dry_run() {
            FollowupScheduler::new(self.store.clone(), dispatcher.clone())
        } else {
            self.followups.clone()
        };

        for market in markets {
            if self.cancelled() {
                report.cancelled = true;
                warn!(market, "pipeline cancelled before market");
                break;
            }

            let mut market_report = MarketReport {
                market: market.clone(),
                ..Default::default()
            };

            // (a) Ingestion.
            if !self.cancelled() {
                match self.ingest_market(market).await {
                    Ok(stats) => market_report.ingestion = stats,
                    Err(e) => market_report.step_errors.push(format!("ingestion: {e:#}")),
                }
            }

            // (b) Enrichment of pending leads.
            if !self.cancelled() {
                match self.enrich_market(market).await {
                    Ok(stats) => market_report.enrichment = Some(stats),
                    Err(e) => market_report.step_errors.push(format!("enrichment: {e:#}")),
                }
            }

            // (c) Scoring.
            if !self.cancelled() {
                match self.scoring.score_market(market).await {
                    Ok(stats) => market_report.scoring = Some(stats),
                    Err(e) => market_report.step_errors.push(format!("scoring: {e:#}")),
                }
            }

            // (d) Initial outreach.
            if !self.cancelled() {
                match self.initial_outreach(market, &dispatcher).await {
                    Ok(stats) => market_report.outreach = Some(stats),
                    Err(e) => market_report.step_errors.push(format!("outreach: {e:#}")),
                }
            }

            // (e) Followups.
            if !self.cancelled() {
                match followups
                    .run(Some(market.as_str()), self.config.followup_batch_size)
                    .await
                {
                    Ok(stats) => market_report.followups = Some(stats),
                    Err(e) => market_report.step_errors.push(format!("followups: {e:#}")),
                }
            }

            // (f) Hot-lead alerts.
            if !self.cancelled() {
                match self.alerts.run_hot_alerts(market).await {
                    Ok(stats) => market_report.alerts = Some(stats),
                    Err(e) => market_report.step_errors.push(format!("alerts: {e:#}")),
                }
            }

            info!(
                market,
                errors = market_report.step_errors.len(),
                "market pipeline pass done"
            );
            report.markets.push(market_report);
        }

        if self.cancelled() {
            report.cancelled = true;
        }
        Ok(report)
    }

    /// Ingest any data drops present for the market.
    async fn ingest_market(&self, market: &str) -> Result<Option<IngestionStats>> {
        let Some(data_dir) = self.config.data_dir.as_deref() else {
            return Ok(None);
        };
        let market_dir = Path::new(data_dir).join(market.to_ascii_lowercase());
        if !market_dir.is_dir() {
            return Ok(None);
        }
        let parish = market_config(market).default_parish;

        let mut combined = IngestionStats::default();
        let tax_roll = market_dir.join("tax_roll.csv");
        if tax_roll.is_file() {
            let stats = ingest::ingest_tax_roll(&self.store, &tax_roll, market, parish).await?;
            merge_stats(&mut combined, stats);
        }
        // Adjudicated drops come from the county scraper pipeline and
        // ride its feature flag.
        let adjudicated = market_dir.join("adjudicated.csv");
        if self.config.enable_county_scraper && adjudicated.is_file() {
            let stats =
                ingest::ingest_adjudicated_list(&self.store, &adjudicated, market, parish).await?;
            merge_stats(&mut combined, stats);
        }
        let geo = market_dir.join("geo.csv");
        if geo.is_file() {
            let stats = ingest::ingest_geo_shapes(&self.store, &geo).await?;
            merge_stats(&mut combined, stats);
        }

        Ok(Some(combined))
    }

    /// Enrichment: re-validate raw phones that never passed the TCPA
    /// check, then run whichever enrichment capabilities are active
    /// (address verification, geocoding, assessment backfill).
    async fn enrich_market(&self, market: &str) -> Result<EnrichmentStats> {
        let batch = self.config.enrichment_batch_size;
        let owners = self
            .store
            .owners_pending_enrichment(Some(market), batch)
            .await?;
        let mut stats = EnrichmentStats {
            examined: owners.len(),
            ..Default::default()
        };

        for owner in owners {
            let Some(raw) = owner.phone_primary.as_deref() else {
                continue;
            };
            let validation = phone::validate_for_sms(raw);
            if let Some(e164) = validation.e164 {
                let changed = owner.phone_primary.as_deref() != Some(e164.as_str());
                self.store
                    .update_owner_phone(owner.id, Some(&e164), validation.is_mobile)
                    .await?;
                if changed {
                    stats.phones_normalized += 1;
                }
                if validation.is_mobile {
                    stats.marked_tcpa_safe += 1;
                }
            }
        }

        // Address verification: standardize situs text in place.
        if self.enrichment.verifier_active() {
            for parcel in self.store.parcels_with_situs(market, batch).await? {
                let Some(situs) = parcel.situs_address.as_deref() else {
                    continue;
                };
                if let Some(verified) = self.enrichment.verify_address(situs).await? {
                    if verified.standardized != situs {
                        self.store
                            .update_parcel_situs(parcel.id, &verified.standardized)
                            .await?;
                        stats.addresses_standardized += 1;
                    }
                }
            }
        }

        // Geocode parcels with no coordinates yet.
        if self.enrichment.geocoder_active() {
            for parcel in self.store.parcels_missing_location(market, batch).await? {
                let address = format!(
                    "{}, {}, {}",
                    parcel.situs_address.as_deref().unwrap_or(""),
                    parcel.parish,
                    parcel.state.as_deref().unwrap_or("LA"),
                );
                if let Some(point) = self.enrichment.geocode(&address).await? {
                    self.store
                        .set_parcel_location(
                            &parcel.canonical_parcel_id,
                            point.latitude,
                            point.longitude,
                            None,
                        )
                        .await?;
                    stats.geocoded += 1;
                }
            }
        }

        // Assessment backfill from the property-data provider.
        // Existing figures always win; a provider that returns nothing
        // changes nothing.
        if self.enrichment.lookup_active() {
            for parcel in self.store.parcels_missing_assessment(market, batch).await? {
                if let Some(facts) = self
                    .enrichment
                    .lookup_property(&parcel.canonical_parcel_id)
                    .await?
                {
                    self.store
                        .backfill_parcel_facts(
                            parcel.id,
                            facts.land_assessed_value,
                            facts.improvement_assessed_value,
                            facts.lot_size_acres,
                        )
                        .await?;
                    stats.assessments_backfilled += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Initial outreach: best-scored NEW leads, bounded by the batch
    /// size and the remaining daily SMS budget, dispatched through a
    /// small worker pool over a bounded queue.
    async fn initial_outreach(
        &self,
        market: &str,
        dispatcher: &Arc<OutreachDispatcher>,
    ) -> Result<OutreachRunStats> {
        let mut stats = OutreachRunStats::default();

        // Daily budget backpressure: shrink the batch to what is left.
        let day_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);
        let sent_today = self.store.count_sends_since(day_start).await?;
        let remaining_budget = (self.config.max_sms_per_day - sent_today).max(0);
        let batch = self.config.sms_batch_size.min(remaining_budget);
        if batch == 0 {
            warn!(market, "daily sms budget exhausted, outreach skipped");
            return Ok(stats);
        }

        let min_score = market_config(market).min_motivation_score;
        let cooldown_cutoff =
            Utc::now() - chrono::Duration::days(self.config.outreach_cooldown_days.max(0));
        let candidates = self
            .store
            .initial_outreach_candidates(market, min_score, batch, cooldown_cutoff)
            .await?;
        stats.candidates = candidates.len();
        if candidates.is_empty() {
            return Ok(stats);
        }

        // Bounded queue feeding a fixed worker pool; each worker
        // drives its dispatch sequentially so lock + idempotency stay
        // contiguous. A raised gateway error (auth, rate limit) halts
        // the whole batch.
        let halt = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<i64>(OUTREACH_WORKERS * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(OUTREACH_WORKERS);
        for _ in 0..OUTREACH_WORKERS {
            let rx = rx.clone();
            let dispatcher = dispatcher.clone();
            let halt = halt.clone();
            workers.push(tokio::spawn(async move {
                let mut counts = OutreachRunStats::default();
                loop {
                    let lead_id = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(lead_id) = lead_id else { break };
                    if halt.load(Ordering::Relaxed) {
                        counts.skipped += 1;
                        continue;
                    }
                    match dispatcher
                        .dispatch(lead_id, MessageContext::Intro, None, false)
                        .await
                    {
                        Ok(outcome) => match outcome {
                            DispatchOutcome::Completed(attempt)
                                if matches!(
                                    attempt.status,
                                    crate::models::AttemptStatus::Sent
                                        | crate::models::AttemptStatus::DryRun
                                ) =>
                            {
                                counts.sent += 1;
                            }
                            DispatchOutcome::Completed(_) => counts.failed += 1,
                            DispatchOutcome::Blocked(_) | DispatchOutcome::NotFound => {
                                counts.blocked += 1;
                            }
                            DispatchOutcome::Locked | DispatchOutcome::Duplicate(_) => {
                                counts.skipped += 1;
                            }
                        },
                        Err(e) => {
                            // Auth/rate-limit class failure: halt the batch.
                            error!(lead_id, error = %e, "dispatch raised, halting batch");
                            halt.store(true, Ordering::Relaxed);
                            counts.failed += 1;
                        }
                    }
                }
                counts
            }));
        }

        for lead_id in candidates {
            if halt.load(Ordering::Relaxed) {
                break;
            }
            if tx.send(lead_id).await.is_err() {
                break;
            }
        }
        drop(tx);

        for worker in workers {
            if let Ok(counts) = worker.await {
                stats.sent += counts.sent;
                stats.blocked += counts.blocked;
                stats.skipped += counts.skipped;
                stats.failed += counts.failed;
            }
        }
        stats.halted = halt.load(Ordering::Relaxed);

        info!(
            market,
            sent = stats.sent,
            blocked = stats.blocked,
            halted = stats.halted,
            "initial outreach batch done"
        );
        Ok(stats)
    }
}

fn merge_stats(into: &mut IngestionStats, from: IngestionStats) {
    into.rows_processed += from.rows_processed;
    into.rows_skipped += from.rows_skipped;
    into.created_parcels += from.created_parcels;
    into.updated_parcels += from.updated_parcels;
    into.created_parties += from.created_parties;
    into.created_owners += from.created_owners;
    into.created_leads += from.created_leads;
    into.errors += from.errors;
    into.error_samples.extend(from.error_samples);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScoreThresholds, ScoringWeights};
    use crate::locks::SendLockService;
    use crate::resilience::{CircuitBreaker, RateLimiter};
    use crate::store::testutil::temp_store;
    use crate::store::IngestParcel;
    use std::time::Duration as StdDuration;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            database_url: ":memory:".into(),
            bind_addr: "127.0.0.1:0".into(),
            dry_run: true,
            thresholds: ScoreThresholds::default(),
            weights: ScoringWeights::default(),
            outreach_cooldown_days: 7,
            max_sms_per_day: 200,
            sms_batch_size: 25,
            enrichment_batch_size: 100,
            followup_batch_size: 50,
            twilio_account_sid: None,
            twilio_auth_token: None,
            twilio_from_number: None,
            twilio_messaging_service_sid: None,
            twilio_status_callback_url: None,
            twilio_max_messages_per_second: 10.0,
            alert_dedup_hours: 24,
            openrouter_api_key: None,
            llm_model: "test".into(),
            retail_multiplier: 1.4,
            markets: vec!["LA".into()],
            public_base_url: None,
            nightly_hour_utc: 7,
            data_dir: None,
            enable_usps: false,
            enable_google: false,
            enable_comps: false,
            enable_propstream: false,
            enable_county_scraper: false,
        })
    }

    fn pipeline_with_config(
        store: &Store,
        config: Arc<Config>,
        cancel: watch::Receiver<bool>,
    ) -> NightlyPipeline {
        let dispatcher = Arc::new(OutreachDispatcher::new(
            store.clone(),
            SendLockService::new(store.clone()),
            None,
            None,
            CircuitBreaker::new("llm", 3, StdDuration::from_secs(60)),
            CircuitBreaker::new("twilio", 5, StdDuration::from_secs(60)),
            RateLimiter::per_second("twilio", 10.0),
            true,
        ));
        NightlyPipeline::new(
            store.clone(),
            config.clone(),
            Arc::new(ScoringEngine::new(
                store.clone(),
                ScoringWeights::default(),
                ScoreThresholds::default(),
            )),
            dispatcher.clone(),
            FollowupScheduler::new(store.clone(), dispatcher),
            Arc::new(AlertDispatcher::new(
                store.clone(),
                reqwest::Client::new(),
                None,
                24,
                true,
            )),
            Arc::new(EnrichmentService::from_config(&config)),
            SchedulerLockService::new(store.clone()),
            cancel,
        )
    }

    fn pipeline(store: &Store, cancel: watch::Receiver<bool>) -> NightlyPipeline {
        pipeline_with_config(store, test_config(), cancel)
    }

    async fn seed_hot_candidate(store: &Store) -> i64 {
        let (parcel_id, _) = store
            .upsert_parcel(&IngestParcel {
                canonical_parcel_id: "N1".into(),
                parish: "East Baton Rouge".into(),
                market_code: "LA".into(),
                postal_code: Some("70815".into()),
                land_assessed_value: Some(40_000.0),
                improvement_assessed_value: Some(0.0),
                lot_size_acres: Some(2.0),
                is_adjudicated: Some(true),
                years_tax_delinquent: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();
        let (party_id, _) = store
            .upsert_party("hn", "JOHN DOE", "70801", "John Doe", None, "LA")
            .await
            .unwrap();
        let (owner_id, _) = store
            .ensure_owner(party_id, Some("+12255550147"), None, true)
            .await
            .unwrap();
        store.upsert_lead(owner_id, parcel_id, "LA").await.unwrap().0
    }

    #[tokio::test]
    async fn pipeline_runs_and_records_task() {
        let (store, _file) = temp_store();
        seed_hot_candidate(&store).await;
        let (_tx, rx) = watch::channel(false);
        let pipeline = pipeline(&store, rx);

        let outcome = pipeline.run(vec!["LA".into()], true).await.unwrap();
        let PipelineOutcome::Completed(report) = outcome else {
            panic!("pipeline should run");
        };
        assert_eq!(report.markets.len(), 1);
        assert!(report.markets[0].scoring.is_some());
        assert!(!report.cancelled);

        let task = store.get_task(&report.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, crate::models::TaskStatus::Completed);

        // Scoring promoted the distressed lead to HOT, so it is not an
        // initial-outreach candidate (those stay in NEW).
        let scoring = report.markets[0].scoring.as_ref().unwrap();
        assert_eq!(scoring.hot, 1);
    }

    #[tokio::test]
    async fn pipeline_respects_lock() {
        let (store, _file) = temp_store();
        let (_tx, rx) = watch::channel(false);
        let pipeline = pipeline(&store, rx);

        // Another instance holds the nightly lock.
        let other = SchedulerLockService::new(store.clone());
        assert!(other
            .acquire(NIGHTLY_LOCK_NAME, Duration::hours(1))
            .await
            .unwrap());

        let outcome = pipeline.run(vec!["LA".into()], true).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::LockNotAcquired));
    }

    #[tokio::test]
    async fn enrichment_flags_gate_capabilities() {
        let (store, _file) = temp_store();
        store
            .upsert_parcel(&crate::store::IngestParcel {
                canonical_parcel_id: "G1".into(),
                parish: "East Baton Rouge".into(),
                market_code: "LA".into(),
                situs_address: Some("123  main   st".into()),
                state: Some("LA".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        // Flags off: the enrichment step leaves the parcel alone.
        let (_tx, rx) = watch::channel(false);
        let off = pipeline(&store, rx.clone());
        let stats = off.enrich_market("LA").await.unwrap();
        assert_eq!(stats.geocoded, 0);
        assert_eq!(stats.addresses_standardized, 0);

        // Flags on: the offline providers standardize and geocode.
        let mut config = (*test_config()).clone();
        config.enable_usps = true;
        config.enable_google = true;
        config.enable_propstream = true;
        let on = pipeline_with_config(&store, Arc::new(config), rx);
        let stats = on.enrich_market("LA").await.unwrap();
        assert_eq!(stats.addresses_standardized, 1);
        assert_eq!(stats.geocoded, 1);
        // The offline property lookup never fabricates values.
        assert_eq!(stats.assessments_backfilled, 0);

        let parcel = store
            .get_parcel_by_canonical_id("G1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parcel.situs_address.as_deref(), Some("123 MAIN ST"));
        assert!((parcel.latitude.unwrap() - 30.4515).abs() < 1e-6);
        assert!(parcel.land_assessed_value.is_none());
    }

    #[tokio::test]
    async fn cancelled_pipeline_marks_task() {
        let (store, _file) = temp_store();
        seed_hot_candidate(&store).await;
        let (tx, rx) = watch::channel(true);
        let pipeline = pipeline(&store, rx);

        let outcome = pipeline.run(vec!["LA".into()], true).await.unwrap();
        let PipelineOutcome::Completed(report) = outcome else {
            panic!("pipeline should complete with cancellation");
        };
        assert!(report.cancelled);
        assert!(report.markets.is_empty());

        let task = store.get_task(&report.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, crate::models::TaskStatus::Cancelled);
        drop(tx);
    }
}
