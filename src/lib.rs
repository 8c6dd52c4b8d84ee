//! Parcelbot backend library.
//!
//! Lead-lifecycle engine: ingestion, scoring, compliant SMS outreach,
//! reply handling, alerts and buyer distribution. The binary wires
//! these modules behind the HTTP API and the nightly scheduler.

pub mod alerts;
pub mod api;
pub mod buyers;
pub mod config;
pub mod enrichment;
pub mod followup;
pub mod idempotency;
pub mod ingest;
pub mod llm;
pub mod locks;
pub mod markets;
pub mod models;
pub mod outreach;
pub mod phone;
pub mod pipeline;
pub mod replies;
pub mod resilience;
pub mod scoring;
pub mod state;
pub mod store;

pub use state::AppState;
