//! Lead endpoints: listing, detail, manual create, status patch.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::ingest::{EntityResolver, IngestRecord};
use crate::markets;
use crate::models::{Lead, LeadBundle, PipelineStage, TimelineEvent};
use crate::state::AppState;
use crate::store::LeadFilter;

#[derive(Debug, Deserialize)]
pub struct LeadListQuery {
    pub market: Option<String>,
    pub stage: Option<String>,
    pub min_score: Option<i64>,
    #[serde(default)]
    pub tcpa_safe_only: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LeadListResponse {
    pub leads: Vec<Lead>,
    pub count: usize,
}

pub async fn list_leads(
    State(state): State<AppState>,
    Query(query): Query<LeadListQuery>,
) -> Result<Json<LeadListResponse>, ApiError> {
    let stage = match query.stage.as_deref() {
        Some(raw) => Some(
            PipelineStage::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown stage: {raw}")))?,
        ),
        None => None,
    };

    let leads = state
        .store
        .list_leads(&LeadFilter {
            market: query.market,
            stage,
            min_score: query.min_score,
            tcpa_safe_only: query.tcpa_safe_only,
            limit: query.limit.unwrap_or(100),
            offset: query.offset.unwrap_or(0),
        })
        .await?;

    Ok(Json(LeadListResponse {
        count: leads.len(),
        leads,
    }))
}

#[derive(Debug, Serialize)]
pub struct LeadDetailResponse {
    #[serde(flatten)]
    pub bundle: LeadBundle,
    pub timeline: Vec<TimelineEvent>,
}

pub async fn get_lead(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<LeadDetailResponse>, ApiError> {
    let bundle = state
        .store
        .get_lead_bundle(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let timeline = state.store.list_timeline(id, 20).await?;
    Ok(Json(LeadDetailResponse { bundle, timeline }))
}

#[derive(Debug, Deserialize)]
pub struct PatchLeadRequest {
    pub status: Option<String>,
    /// One-way switch; the DNR flag is permanent once set.
    pub dnr: Option<bool>,
}

pub async fn patch_lead(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<PatchLeadRequest>,
) -> Result<Json<Lead>, ApiError> {
    let lead = state.store.get_lead(id).await?.ok_or(ApiError::NotFound)?;

    if let Some(status) = body.status.as_deref() {
        let status = status.trim();
        if status.is_empty() {
            return Err(ApiError::BadRequest("status must not be empty".into()));
        }
        state.store.set_lead_status(id, status).await?;
    }

    match body.dnr {
        Some(true) => state.store.mark_owner_dnr(lead.owner_id).await?,
        Some(false) => {
            return Err(ApiError::BadRequest("the DNR flag cannot be cleared".into()));
        }
        None => {}
    }

    let lead = state.store.get_lead(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(lead))
}

/// Manual lead creation runs through the same entity resolver as batch
/// ingestion, so the dedup keys stay consistent.
#[derive(Debug, Deserialize)]
pub struct CreateLeadRequest {
    pub parcel_id: String,
    pub parish: Option<String>,
    pub market_code: String,
    pub owner_name: String,
    pub mailing_zip: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub situs_address: Option<String>,
    pub postal_code: Option<String>,
    pub land_assessed_value: Option<f64>,
    pub improvement_assessed_value: Option<f64>,
    pub lot_size_acres: Option<f64>,
    #[serde(default)]
    pub is_adjudicated: bool,
    pub years_tax_delinquent: Option<i64>,
}

pub async fn create_lead(
    State(state): State<AppState>,
    Json(body): Json<CreateLeadRequest>,
) -> Result<Json<Lead>, ApiError> {
    if !markets::is_valid_market(&body.market_code) {
        return Err(ApiError::BadRequest(format!(
            "unknown market: {}",
            body.market_code
        )));
    }
    if body.owner_name.trim().is_empty() {
        return Err(ApiError::BadRequest("owner_name must not be empty".into()));
    }

    let market = body.market_code.trim().to_ascii_uppercase();
    let parish = body
        .parish
        .clone()
        .unwrap_or_else(|| markets::market_config(&market).default_parish.to_string());

    let resolver = EntityResolver::new(state.store.clone());
    let stats = resolver
        .resolve(&IngestRecord {
            raw_parcel_id: body.parcel_id,
            parish,
            market_code: market,
            owner_name: Some(body.owner_name),
            mailing_zip: body.mailing_zip,
            phone: body.phone,
            email: body.email,
            situs_address: body.situs_address,
            postal_code: body.postal_code,
            land_assessed_value: body.land_assessed_value,
            improvement_assessed_value: body.improvement_assessed_value,
            lot_size_acres: body.lot_size_acres,
            is_adjudicated: Some(body.is_adjudicated),
            years_tax_delinquent: body.years_tax_delinquent,
            ..Default::default()
        })
        .await?;

    let lead_id = stats
        .lead_id
        .ok_or_else(|| ApiError::BadRequest("row did not resolve to a lead".into()))?;

    // Score the fresh lead immediately so the response is useful.
    state.scoring.score_lead(lead_id).await?;
    let lead = state
        .store
        .get_lead(lead_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(lead))
}

pub async fn lead_timeline(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<TimelineEvent>>, ApiError> {
    if state.store.get_lead(id).await?.is_none() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(state.store.list_timeline(id, 100).await?))
}
