//! Outreach endpoints, webhooks, the nightly trigger and task reads.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Form, Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use super::ApiError;
use crate::models::{
    AttemptStatus, BackgroundTask, MessageContext, OutreachAttempt, TaskStatus,
};
use crate::outreach::twilio::validate_signature;
use crate::outreach::DispatchOutcome;
use crate::pipeline::PipelineOutcome;
use crate::replies::InboundOutcome;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SingleSendRequest {
    pub context: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub outcome: &'static str,
    pub attempt: Option<OutreachAttempt>,
}

fn outcome_response(outcome: DispatchOutcome) -> Result<Json<SendResponse>, ApiError> {
    match outcome {
        DispatchOutcome::NotFound => Err(ApiError::NotFound),
        DispatchOutcome::Blocked(blocked) => Err(ApiError::Blocked {
            code: blocked.code.as_str().to_string(),
            reason: blocked.reason,
        }),
        DispatchOutcome::Locked => Err(ApiError::Conflict("send lock held".into())),
        DispatchOutcome::Duplicate(attempt) => Ok(Json(SendResponse {
            outcome: "duplicate",
            attempt: Some(attempt),
        })),
        DispatchOutcome::Completed(attempt) => Ok(Json(SendResponse {
            outcome: match attempt.status {
                AttemptStatus::Sent => "sent",
                AttemptStatus::DryRun => "dry_run",
                _ => "failed",
            },
            attempt: Some(attempt),
        })),
    }
}

pub async fn single(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<SingleSendRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    let context = match body.context.as_deref() {
        Some(raw) => MessageContext::parse(raw)
            .filter(|c| *c != MessageContext::Ack)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown context: {raw}")))?,
        None => MessageContext::Intro,
    };

    let outcome = state
        .dispatcher
        .dispatch(id, context, body.message, body.force)
        .await
        .map_err(ApiError::from_dispatch_error)?;
    outcome_response(outcome)
}

#[derive(Debug, Deserialize)]
pub struct BatchSendRequest {
    pub market: Option<String>,
    pub limit: Option<i64>,
    pub min_score: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BatchSendResponse {
    pub attempted: usize,
    pub sent: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Manual batch trigger: same candidate query as the nightly initial
/// outreach, dispatched sequentially.
pub async fn batch(
    State(state): State<AppState>,
    Json(body): Json<BatchSendRequest>,
) -> Result<Json<BatchSendResponse>, ApiError> {
    let markets = match body.market {
        Some(market) => vec![market],
        None => state.config.markets.clone(),
    };
    let limit = body.limit.unwrap_or(state.config.sms_batch_size).clamp(1, 500);

    let mut response = BatchSendResponse {
        attempted: 0,
        sent: 0,
        blocked: 0,
        skipped: 0,
        failed: 0,
    };

    for market in &markets {
        let min_score = body
            .min_score
            .unwrap_or(crate::markets::market_config(market).min_motivation_score);
        let cooldown_cutoff = Utc::now()
            - chrono::Duration::days(state.config.outreach_cooldown_days.max(0));
        let candidates = state
            .store
            .initial_outreach_candidates(market, min_score, limit, cooldown_cutoff)
            .await?;

        for lead_id in candidates {
            response.attempted += 1;
            match state
                .dispatcher
                .dispatch(lead_id, MessageContext::Intro, None, false)
                .await
            {
                Ok(outcome) => match outcome {
                    DispatchOutcome::Completed(attempt)
                        if matches!(
                            attempt.status,
                            AttemptStatus::Sent | AttemptStatus::DryRun
                        ) =>
                    {
                        response.sent += 1;
                    }
                    DispatchOutcome::Completed(_) => response.failed += 1,
                    DispatchOutcome::Blocked(_) | DispatchOutcome::NotFound => {
                        response.blocked += 1;
                    }
                    DispatchOutcome::Locked | DispatchOutcome::Duplicate(_) => {
                        response.skipped += 1;
                    }
                },
                Err(e) => {
                    // Raised errors (auth, rate limit) halt the batch.
                    warn!(lead_id, error = %e, "batch send raised, halting");
                    response.failed += 1;
                    return Ok(Json(response));
                }
            }
        }
    }

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub lead_id: Option<i64>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<OutreachAttempt>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            AttemptStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };
    let attempts = state
        .store
        .list_attempts(
            query.lead_id,
            status,
            query.limit.unwrap_or(100),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(attempts))
}

/// Reconstruct the public webhook URL for signature verification.
fn webhook_url(state: &AppState, path: &str) -> Option<String> {
    state
        .config
        .public_base_url
        .as_deref()
        .map(|base| format!("{}{path}", base.trim_end_matches('/')))
}

fn verify_webhook(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    form: &HashMap<String, String>,
) -> Result<(), ApiError> {
    // Signature is mandatory outside dry-run.
    if state.config.dry_run {
        return Ok(());
    }
    let Some(twilio) = state.twilio.as_deref() else {
        return Err(ApiError::Forbidden("sms gateway not configured".into()));
    };
    let Some(url) = webhook_url(state, path) else {
        return Err(ApiError::Forbidden("PUBLIC_BASE_URL not configured".into()));
    };

    let signature = headers
        .get("X-Twilio-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if signature.is_empty() {
        return Err(ApiError::Forbidden("missing webhook signature".into()));
    }

    let params: Vec<(String, String)> = form
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !validate_signature(twilio.auth_token(), &url, &params, signature) {
        warn!("webhook signature validation failed");
        return Err(ApiError::Forbidden("invalid webhook signature".into()));
    }
    Ok(())
}

/// Inbound SMS webhook (form-encoded): From, Body, MessageSid.
pub async fn inbound_sms(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<InboundOutcome>, ApiError> {
    verify_webhook(&state, &headers, "/webhooks/sms", &form)?;

    let from = form
        .get("From")
        .ok_or_else(|| ApiError::BadRequest("missing From".into()))?;
    let body = form
        .get("Body")
        .ok_or_else(|| ApiError::BadRequest("missing Body".into()))?;
    let sid = form
        .get("MessageSid")
        .ok_or_else(|| ApiError::BadRequest("missing MessageSid".into()))?;

    let outcome = state.conversation.process_inbound(sid, from, body).await?;
    Ok(Json(outcome))
}

/// Delivery-status webhook: updates the attempt keyed by MessageSid.
pub async fn delivery_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_webhook(&state, &headers, "/webhooks/status", &form)?;

    let sid = form
        .get("MessageSid")
        .ok_or_else(|| ApiError::BadRequest("missing MessageSid".into()))?;
    let message_status = form
        .get("MessageStatus")
        .map(String::as_str)
        .unwrap_or_default();

    let (status, delivered_at) = match message_status {
        "delivered" => (AttemptStatus::Sent, Some(Utc::now())),
        "failed" | "undelivered" => (AttemptStatus::Failed, None),
        _ => (AttemptStatus::Sent, None),
    };
    let updated = state
        .store
        .update_delivery_status(sid, status, delivered_at)
        .await?;
    if !updated {
        info!(sid = %sid, "delivery status for unknown message");
    }
    Ok(Json(serde_json::json!({ "updated": updated })))
}

#[derive(Debug, Deserialize)]
pub struct NightlyRequest {
    pub markets: Option<Vec<String>>,
    #[serde(default)]
    pub dry_run: bool,
}

pub async fn nightly(
    State(state): State<AppState>,
    Json(body): Json<NightlyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let markets = body
        .markets
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| state.config.markets.clone());

    match state.pipeline.run(markets, body.dry_run).await? {
        PipelineOutcome::LockNotAcquired => {
            Err(ApiError::Conflict("lock_not_acquired".into()))
        }
        PipelineOutcome::Completed(report) => Ok(Json(serde_json::to_value(report).map_err(
            |e| ApiError::Internal(e.into()),
        )?)),
    }
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub task_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<BackgroundTask>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };
    let tasks = state
        .store
        .list_tasks(query.task_type.as_deref(), status, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(tasks))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<BackgroundTask>, ApiError> {
    state
        .store
        .get_task(&task_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}
