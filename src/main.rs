//! Parcelbot: lead-lifecycle engine for county land records.
//!
//! Runs the HTTP API plus the nightly scheduler loop. Exit codes:
//! 0 normal, 1 invalid configuration, 2 database unreachable.

use anyhow::Result;
use chrono::Timelike;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parcelbot_backend::api;
use parcelbot_backend::config::Config;
use parcelbot_backend::pipeline::PipelineOutcome;
use parcelbot_backend::state::AppState;
use parcelbot_backend::store::Store;

#[derive(Debug, Parser)]
#[command(name = "parcelbot", about = "Lead lifecycle engine")]
struct Args {
    /// Run the nightly pipeline once and exit instead of serving.
    #[arg(long)]
    nightly: bool,

    /// Markets for --nightly (defaults to the configured set).
    #[arg(long)]
    market: Vec<String>,

    /// Force dry-run for --nightly regardless of configuration.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "parcelbot_backend=info,parcelbot=info,tower_http=warn",
                )
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %format!("{e:#}"), "configuration invalid");
            std::process::exit(1);
        }
    };

    let store = match Store::open(&config.database_url) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %format!("{e:#}"), db = %config.database_url, "database unreachable");
            std::process::exit(2);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    let state = match AppState::build(config.clone(), store, shutdown_rx.clone()) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %format!("{e:#}"), "state construction failed");
            std::process::exit(1);
        }
    };

    if args.nightly {
        let markets = if args.market.is_empty() {
            config.markets.clone()
        } else {
            args.market.clone()
        };
        match state.pipeline.run(markets, args.dry_run || config.dry_run).await {
            Ok(PipelineOutcome::Completed(report)) => {
                info!(task_id = %report.task_id, cancelled = report.cancelled, "nightly run done");
                std::process::exit(0);
            }
            Ok(PipelineOutcome::LockNotAcquired) => {
                warn!("nightly lock held elsewhere, nothing to do");
                std::process::exit(0);
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "nightly run failed");
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = serve(state, shutdown_rx).await {
        error!(error = %format!("{e:#}"), "server failed");
        std::process::exit(1);
    }
}

async fn serve(state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    spawn_scheduler_loop(state.clone());

    let addr = state.config.bind_addr.clone();
    let listener = TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        dry_run = state.config.dry_run,
        markets = ?state.config.markets,
        "🚀 parcelbot listening"
    );

    let router = api::router(state);
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!("shutdown signal received, draining connections");
        })
        .await?;
    Ok(())
}

/// Arm the shutdown channel on ctrl-c / SIGTERM. The nightly pipeline
/// polls this between steps.
fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "sigterm handler unavailable");
                    let _ = ctrl_c.await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("⏹  signal received, requesting cooperative shutdown");
        let _ = shutdown_tx.send(true);
    });
}

/// Minute-resolution scheduler: fires the nightly pipeline once per
/// UTC day at the configured hour and sweeps expired locks.
fn spawn_scheduler_loop(state: AppState) {
    tokio::spawn(async move {
        let mut last_run_date: Option<chrono::NaiveDate> = None;
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        let mut shutdown = state.shutdown.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("scheduler loop stopping");
                    return;
                }
            }

            let now = chrono::Utc::now();
            let today = now.date_naive();
            if now.hour() != state.config.nightly_hour_utc || last_run_date == Some(today) {
                continue;
            }
            last_run_date = Some(today);

            // Hygiene sweep before taking the nightly lock.
            if let Err(e) = state.store.cleanup_expired_scheduler_locks(now).await {
                warn!(error = %e, "expired lock sweep failed");
            }

            info!("⏰ nightly window reached, starting pipeline");
            match state
                .pipeline
                .run(state.config.markets.clone(), state.config.dry_run)
                .await
            {
                Ok(PipelineOutcome::Completed(report)) => {
                    info!(
                        task_id = %report.task_id,
                        cancelled = report.cancelled,
                        "nightly pipeline finished"
                    );
                }
                Ok(PipelineOutcome::LockNotAcquired) => {
                    info!("nightly pipeline already running elsewhere");
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "nightly pipeline failed");
                }
            }
        }
    });
}
