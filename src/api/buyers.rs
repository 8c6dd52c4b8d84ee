//! Buyer, blast, deal sheet and call prep endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use super::ApiError;
use crate::buyers::{BlastResult, DealSheetContent, OfferRange, PrepPack};
use crate::markets;
use crate::models::Buyer;
use crate::state::AppState;
use crate::store::NewBuyer;

#[derive(Debug, Deserialize)]
pub struct CreateBuyerRequest {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub market_codes: Vec<String>,
    #[serde(default)]
    pub counties: Vec<String>,
    pub min_acres: Option<f64>,
    pub max_acres: Option<f64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub target_spread: Option<f64>,
    #[serde(default)]
    pub vip: bool,
    #[serde(default)]
    pub pof_verified: bool,
}

pub async fn create_buyer(
    State(state): State<AppState>,
    Json(body): Json<CreateBuyerRequest>,
) -> Result<Json<Buyer>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }
    for market in &body.market_codes {
        if !markets::is_valid_market(market) {
            return Err(ApiError::BadRequest(format!("unknown market: {market}")));
        }
    }
    if let (Some(min), Some(max)) = (body.min_acres, body.max_acres) {
        if min > max {
            return Err(ApiError::BadRequest("min_acres exceeds max_acres".into()));
        }
    }
    if let (Some(min), Some(max)) = (body.price_min, body.price_max) {
        if min > max {
            return Err(ApiError::BadRequest("price_min exceeds price_max".into()));
        }
    }

    let id = state
        .store
        .insert_buyer(&NewBuyer {
            name: body.name,
            phone: body.phone,
            email: body.email,
            market_codes: body
                .market_codes
                .iter()
                .map(|m| m.trim().to_ascii_uppercase())
                .collect(),
            counties: body.counties,
            min_acres: body.min_acres,
            max_acres: body.max_acres,
            price_min: body.price_min,
            price_max: body.price_max,
            target_spread: body.target_spread,
            vip: body.vip,
            pof_verified: body.pof_verified,
        })
        .await?;

    let buyer = state.store.get_buyer(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(buyer))
}

pub async fn get_buyer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Buyer>, ApiError> {
    state
        .store
        .get_buyer(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

#[derive(Debug, Deserialize)]
pub struct BlastRequest {
    pub buyer_ids: Option<Vec<i64>>,
    pub max_buyers: Option<usize>,
    pub min_match_score: Option<f64>,
    #[serde(default)]
    pub dry_run: bool,
}

pub async fn blast(
    State(state): State<AppState>,
    Path(lead_id): Path<i64>,
    Json(body): Json<BlastRequest>,
) -> Result<Json<BlastResult>, ApiError> {
    if state.store.get_lead(lead_id).await?.is_none() {
        return Err(ApiError::NotFound);
    }
    let result = state
        .blast
        .send_blast(
            lead_id,
            body.buyer_ids,
            body.min_match_score
                .unwrap_or(crate::buyers::DEFAULT_MIN_MATCH_SCORE),
            body.max_buyers.unwrap_or(crate::buyers::DEFAULT_MAX_BUYERS),
            body.dry_run,
        )
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct PrepPackQuery {
    pub discount_low: Option<f64>,
    pub discount_high: Option<f64>,
}

pub async fn prep_pack(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<PrepPackQuery>,
) -> Result<Json<PrepPack>, ApiError> {
    for d in [query.discount_low, query.discount_high].into_iter().flatten() {
        if !(0.05..=1.0).contains(&d) {
            return Err(ApiError::BadRequest(format!("discount out of range: {d}")));
        }
    }
    state
        .call_prep
        .prep_pack(id, query.discount_low, query.discount_high)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn offer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<OfferRange>, ApiError> {
    state
        .call_prep
        .offer(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn script(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let script = state
        .call_prep
        .script(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(serde_json::json!({ "lead_id": id, "script": script })))
}

#[derive(Debug, Deserialize)]
pub struct DealSheetQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn deal_sheet(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<DealSheetQuery>,
) -> Result<Json<DealSheetContent>, ApiError> {
    state
        .deal_sheets
        .generate(id, query.force)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}
