//! HTTP surface: routing and the error-to-status mapping.

mod buyers;
mod leads;
mod outreach;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::state::AppState;

/// API error carrying a code string that stays stable across versions.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound,
    Conflict(String),
    /// TCPA/classification gate refusals (422).
    Blocked { code: String, reason: String },
    TooManyRequests,
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl ApiError {
    /// Dispatch errors that were raised (not mapped) still need an
    /// HTTP status; rate-limit raises map to 429.
    pub fn from_dispatch_error(e: anyhow::Error) -> Self {
        let text = format!("{e:#}");
        if text.contains("rate_limited") {
            Self::TooManyRequests
        } else {
            Self::Internal(e)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "BAD_REQUEST".into(), message),
            Self::Forbidden(message) => (StatusCode::FORBIDDEN, "FORBIDDEN".into(), message),
            Self::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND".into(), "not found".into()),
            Self::Conflict(message) => (StatusCode::CONFLICT, "CONFLICT".into(), message),
            Self::Blocked { code, reason } => (StatusCode::UNPROCESSABLE_ENTITY, code, reason),
            Self::TooManyRequests => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED".into(),
                "rate limited".into(),
            ),
            Self::Internal(e) => {
                error!(error = %format!("{e:#}"), "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL".into(),
                    "internal error".into(),
                )
            }
        };

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/leads", get(leads::list_leads).post(leads::create_lead))
        .route("/leads/:id", get(leads::get_lead).patch(leads::patch_lead))
        .route("/leads/:id/timeline", get(leads::lead_timeline))
        .route("/leads/:id/deal-sheet", get(buyers::deal_sheet))
        .route("/outreach/batch", post(outreach::batch))
        .route("/outreach/lead/:id", post(outreach::single))
        .route("/outreach/history", get(outreach::history))
        .route("/webhooks/sms", post(outreach::inbound_sms))
        .route("/webhooks/status", post(outreach::delivery_status))
        .route("/pipeline/nightly", post(outreach::nightly))
        .route("/tasks", get(outreach::list_tasks))
        .route("/tasks/:task_id", get(outreach::get_task))
        .route("/buyers", post(buyers::create_buyer))
        .route("/buyers/:id", get(buyers::get_buyer))
        .route("/blasts/:lead_id", post(buyers::blast))
        .route("/calls/:id/prep-pack", get(buyers::prep_pack))
        .route("/calls/:id/offer", get(buyers::offer))
        .route("/calls/:id/script", get(buyers::script))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
