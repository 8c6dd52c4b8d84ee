//! End-to-end dry-run exercise: ingest a tax roll, score, run the
//! nightly pipeline, then drive a reply through the conversation
//! engine. No external services are touched.

use std::io::Write;
use std::sync::Arc;

use tokio::sync::watch;

use parcelbot_backend::config::{Config, ScoreThresholds, ScoringWeights};
use parcelbot_backend::models::{
    AlertConfig, AttemptStatus, MessageContext, PipelineStage, ReplyClassification,
};
use parcelbot_backend::pipeline::PipelineOutcome;
use parcelbot_backend::state::AppState;
use parcelbot_backend::store::Store;

fn test_config(db_path: &str, data_dir: Option<String>) -> Arc<Config> {
    Arc::new(Config {
        database_url: db_path.to_string(),
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
        data_dir,
        enable_usps: false,
        enable_google: false,
        enable_comps: false,
        enable_propstream: false,
        enable_county_scraper: false,
    })
}

/// Tax roll with one heavily-distressed parcel (scores 100 and lands
/// HOT, off the initial-outreach path) and one moderate parcel that
/// stays NEW and gets the intro SMS.
const TAX_ROLL: &str = "\
parcel_number,taxpayer_name,mailing_zip,situs_zip,land_value,improvement_value,acreage,adjudicated,years_delinquent,phone
12-34,John Doe,70801,70815,40000,0,2.0,yes,4,(225) 555-0147
56-78,Jane Roe,70810,70815,30000,1000,3.0,,2,225-555-0199
";

fn write_market_drop(dir: &std::path::Path) {
    let market_dir = dir.join("la");
    std::fs::create_dir_all(&market_dir).unwrap();
    let mut file = std::fs::File::create(market_dir.join("tax_roll.csv")).unwrap();
    file.write_all(TAX_ROLL.as_bytes()).unwrap();
}

#[tokio::test]
async fn nightly_pipeline_end_to_end_dry_run() {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    write_market_drop(data_dir.path());

    let config = test_config(
        db_file.path().to_str().unwrap(),
        Some(data_dir.path().to_str().unwrap().to_string()),
    );
    let store = Store::open(&config.database_url).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::build(config, store.clone(), shutdown_rx).unwrap();

    // Alert SMS sink for LA; dry-run mode makes the sink succeed.
    store
        .upsert_alert_config(&AlertConfig {
            market_code: "LA".into(),
            enabled: true,
            hot_score_threshold: 75,
            sms_numbers: vec!["+12255550100".into()],
            slack_webhook_url: None,
            dedup_hours: 24,
        })
        .await
        .unwrap();

    // Run the full nightly pipeline.
    let outcome = state.pipeline.run(vec!["LA".into()], true).await.unwrap();
    let PipelineOutcome::Completed(report) = outcome else {
        panic!("pipeline must run");
    };
    assert!(!report.cancelled);
    let market = &report.markets[0];

    // Ingestion created both chains.
    let ingestion = market.ingestion.as_ref().expect("ingestion ran");
    assert_eq!(ingestion.created_parcels, 2);
    assert_eq!(ingestion.created_leads, 2);

    // Scoring promoted the distressed lead to HOT and left the
    // moderate one contactable.
    let scoring = market.scoring.as_ref().expect("scoring ran");
    assert_eq!(scoring.scored, 2);
    assert_eq!(scoring.hot, 1);

    let hot_bundle = store
        .get_lead_bundle(
            store
                .find_lead_by_owner_phone("+12255550147")
                .await
                .unwrap()
                .unwrap(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hot_bundle.lead.motivation_score, 100);
    assert_eq!(hot_bundle.lead.pipeline_stage, PipelineStage::Hot);

    // Initial outreach reached only the NEW lead, as a dry run.
    let outreach = market.outreach.as_ref().expect("outreach ran");
    assert_eq!(outreach.candidates, 1);
    assert_eq!(outreach.sent, 1);

    let new_lead_id = store
        .find_lead_by_owner_phone("+12255550199")
        .await
        .unwrap()
        .unwrap();
    let attempts = store
        .list_attempts(Some(new_lead_id), None, 10, 0)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::DryRun);
    assert_eq!(attempts[0].message_context, MessageContext::Intro);
    assert!(attempts[0].idempotency_key.is_some());

    // Hot-lead alerts fired for the HOT lead (log sink in tests).
    let alerts = market.alerts.as_ref().expect("alerts ran");
    assert_eq!(alerts.sent, 1);

    // A second pipeline run changes no entity counts (reingestion is
    // idempotent) and dedups the alert.
    let counts_before = store.entity_counts().await.unwrap();
    let outcome = state.pipeline.run(vec!["LA".into()], true).await.unwrap();
    let PipelineOutcome::Completed(report2) = outcome else {
        panic!("pipeline must run twice");
    };
    let counts_after = store.entity_counts().await.unwrap();
    assert_eq!(counts_before.parties, counts_after.parties);
    assert_eq!(counts_before.owners, counts_after.owners);
    assert_eq!(counts_before.parcels, counts_after.parcels);
    assert_eq!(counts_before.leads, counts_after.leads);
    // Same-day intro is idempotent: no second attempt row.
    assert_eq!(counts_before.outreach_attempts, counts_after.outreach_attempts);
    assert_eq!(report2.markets[0].alerts.as_ref().unwrap().sent, 0);
    assert_eq!(report2.markets[0].alerts.as_ref().unwrap().deduped, 1);
}

#[tokio::test]
async fn stop_reply_blocks_all_future_outreach() {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let config = test_config(db_file.path().to_str().unwrap(), None);
    let store = Store::open(&config.database_url).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::build(config, store.clone(), shutdown_rx).unwrap();

    // Seed one contactable lead by hand.
    let resolver = parcelbot_backend::ingest::EntityResolver::new(store.clone());
    let stats = resolver
        .resolve(&parcelbot_backend::ingest::IngestRecord {
            raw_parcel_id: "99-11".into(),
            parish: "East Baton Rouge".into(),
            market_code: "LA".into(),
            owner_name: Some("Sam Seller".into()),
            mailing_zip: Some("70801".into()),
            phone: Some("225-555-0123".into()),
            lot_size_acres: Some(2.0),
            land_assessed_value: Some(40_000.0),
            ..Default::default()
        })
        .await
        .unwrap();
    let lead_id = stats.lead_id.unwrap();

    // An intro goes out first (dry-run).
    let outcome = state
        .dispatcher
        .dispatch(lead_id, MessageContext::Intro, None, false)
        .await
        .unwrap();
    assert!(outcome.is_send());

    // The seller texts STOP.
    let inbound = state
        .conversation
        .process_inbound("SMstop1", "+12255550123", "STOP")
        .await
        .unwrap();
    assert!(inbound.opted_out);

    let bundle = store.get_lead_bundle(lead_id).await.unwrap().unwrap();
    assert!(bundle.owner.opt_out);
    assert_eq!(
        bundle.lead.last_reply_classification,
        Some(ReplyClassification::Dead)
    );
    assert!(bundle.lead.next_followup_at.is_none());

    // Every later dispatch is gate-blocked with the stable code, even
    // forced, even tomorrow (new idempotency day would not help).
    let blocked = state
        .dispatcher
        .dispatch(lead_id, MessageContext::Followup, None, true)
        .await
        .unwrap();
    match blocked {
        parcelbot_backend::outreach::DispatchOutcome::Blocked(b) => {
            assert_eq!(b.code.as_str(), "OPT_OUT");
        }
        other => panic!("expected Blocked, got {other:?}"),
    }

    // No sent attempt exists after the opt-out moment.
    let attempts = store.list_attempts(Some(lead_id), None, 20, 0).await.unwrap();
    let opt_out_at = bundle.owner.opt_out_at.unwrap();
    for attempt in attempts {
        if attempt.status == AttemptStatus::Sent || attempt.status == AttemptStatus::DryRun {
            assert!(
                attempt.created_at <= opt_out_at
                    || attempt.message_context == MessageContext::Ack,
                "non-ack send after opt-out: {attempt:?}"
            );
        }
    }
}
