//! Deal sheets and the offer range engine.
//!
//! Offer numbers are never fabricated: no parcel or no assessed land
//! value means no offer, stated explicitly. Missing acreage suppresses
//! all per-acre math and is flagged as a warning.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, warn};

use crate::llm::LlmClient;
use crate::models::{LeadBundle, Parcel};
use crate::resilience::CircuitBreaker;
use crate::store::Store;

pub const DEFAULT_DISCOUNT_LOW: f64 = 0.55;
pub const DEFAULT_DISCOUNT_HIGH: f64 = 0.70;

const SMALL_LOT_PREMIUM: f64 = 0.05;
const LARGE_LOT_DISCOUNT: f64 = 0.05;
const ADJUDICATED_DISCOUNT: f64 = 0.15;
const DELINQUENT_DISCOUNT_PER_YEAR: f64 = 0.02;
const DELINQUENT_DISCOUNT_MAX: f64 = 0.10;
const DISCOUNT_FLOOR: f64 = 0.30;
const DISCOUNT_CEIL: f64 = 0.95;

const CACHE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferConfidence {
    High,
    Medium,
    Low,
    CannotCompute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Justification {
    pub factor: String,
    pub description: String,
    pub impact: String,
}

/// Computed offer range with full justification. Always a range, never
/// a single number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferRange {
    pub low_offer: i64,
    pub high_offer: i64,
    pub land_value: Option<f64>,
    pub acreage: Option<f64>,
    pub discount_low: f64,
    pub discount_high: f64,
    pub price_per_acre_low: Option<i64>,
    pub price_per_acre_high: Option<i64>,
    pub justifications: Vec<Justification>,
    pub confidence: OfferConfidence,
    pub confidence_reason: String,
    pub warnings: Vec<String>,
    pub can_make_offer: bool,
    pub cannot_offer_reason: Option<String>,
}

impl OfferRange {
    pub fn midpoint(&self) -> i64 {
        (self.low_offer + self.high_offer) / 2
    }

    fn no_offer(
        reason: &str,
        warnings: Vec<String>,
        acreage: Option<f64>,
        discount_low: f64,
        discount_high: f64,
    ) -> Self {
        Self {
            low_offer: 0,
            high_offer: 0,
            land_value: None,
            acreage,
            discount_low,
            discount_high,
            price_per_acre_low: None,
            price_per_acre_high: None,
            justifications: vec![Justification {
                factor: "missing_data".into(),
                description: reason.into(),
                impact: "neutral".into(),
            }],
            confidence: OfferConfidence::CannotCompute,
            confidence_reason: reason.into(),
            warnings,
            can_make_offer: false,
            cannot_offer_reason: Some(reason.into()),
        }
    }
}

fn round100(value: f64) -> i64 {
    ((value / 100.0).round() as i64) * 100
}

/// Compute the offer range for a parcel. Pure.
pub fn compute_offer_range(
    parcel: Option<&Parcel>,
    discount_low: f64,
    discount_high: f64,
) -> OfferRange {
    let Some(parcel) = parcel else {
        return OfferRange::no_offer(
            "No parcel data available. Ingest parcel records first.",
            vec!["no_parcel_data".into()],
            None,
            discount_low,
            discount_high,
        );
    };

    let land_value = parcel.land_assessed_value.filter(|v| *v > 0.0);
    let acreage = parcel.lot_size_acres.filter(|a| *a > 0.0);
    let mut warnings: Vec<String> = Vec::new();
    let mut justifications: Vec<Justification> = Vec::new();

    let Some(land_value) = land_value else {
        warnings.push("missing_land_value".into());
        if parcel.land_assessed_value == Some(0.0) {
            warnings.push("zero_land_value".into());
        }
        return OfferRange::no_offer(
            "No assessed land value on record. Check parish assessor records.",
            warnings,
            acreage,
            discount_low,
            discount_high,
        );
    };

    justifications.push(Justification {
        factor: "assessment_basis".into(),
        description: format!("Based on ${land_value:.0} assessed land value"),
        impact: "neutral".into(),
    });

    let mut low = discount_low;
    let mut high = discount_high;

    match acreage {
        Some(acres) => {
            justifications.push(Justification {
                factor: "acreage".into(),
                description: format!("{acres:.2} acres"),
                impact: "neutral".into(),
            });
            if acres < 1.0 {
                low += SMALL_LOT_PREMIUM;
                high += SMALL_LOT_PREMIUM;
                justifications.push(Justification {
                    factor: "small_lot_premium".into(),
                    description: "Small lot (<1 acre), easier to resell".into(),
                    impact: "increase".into(),
                });
            } else if acres > 10.0 {
                low -= LARGE_LOT_DISCOUNT;
                high -= LARGE_LOT_DISCOUNT;
                justifications.push(Justification {
                    factor: "large_lot_discount".into(),
                    description: "Large lot (>10 acres), slower to move".into(),
                    impact: "decrease".into(),
                });
            }
        }
        None => {
            warnings.push("missing_acreage".into());
            justifications.push(Justification {
                factor: "missing_acreage".into(),
                description: "Acreage unknown, per-acre pricing unavailable".into(),
                impact: "neutral".into(),
            });
        }
    }

    if parcel.is_adjudicated {
        low -= ADJUDICATED_DISCOUNT;
        high -= ADJUDICATED_DISCOUNT;
        warnings.push("adjudicated_title_risk".into());
        justifications.push(Justification {
            factor: "adjudicated".into(),
            description: "Adjudicated, title clearing required".into(),
            impact: "decrease".into(),
        });
    }

    let years = parcel.years_tax_delinquent.max(0);
    if years > 0 {
        let delinquent = (years as f64 * DELINQUENT_DISCOUNT_PER_YEAR).min(DELINQUENT_DISCOUNT_MAX);
        low -= delinquent;
        high -= delinquent;
        warnings.push("tax_delinquent".into());
        justifications.push(Justification {
            factor: "tax_delinquent".into(),
            description: format!("{years} years tax delinquent"),
            impact: "decrease".into(),
        });
    }

    let low = low.clamp(DISCOUNT_FLOOR, DISCOUNT_CEIL);
    let high = high.clamp(DISCOUNT_FLOOR, DISCOUNT_CEIL);

    let mut low_offer = round100(land_value * low);
    let mut high_offer = round100(land_value * high);
    if low_offer > high_offer {
        std::mem::swap(&mut low_offer, &mut high_offer);
    }
    low_offer = low_offer.max(500);
    high_offer = high_offer.max(1000);

    let (per_acre_low, per_acre_high) = match acreage {
        Some(acres) => (
            Some((low_offer as f64 / acres) as i64),
            Some((high_offer as f64 / acres) as i64),
        ),
        None => (None, None),
    };

    let (confidence, confidence_reason) = if acreage.is_some() && !parcel.is_adjudicated && years == 0
    {
        (
            OfferConfidence::High,
            "All data available".to_string(),
        )
    } else if acreage.is_none() {
        (
            OfferConfidence::Medium,
            "Missing acreage data, per-acre pricing unavailable".to_string(),
        )
    } else if parcel.is_adjudicated {
        (
            OfferConfidence::Medium,
            "Adjudicated property, verify title status before closing".to_string(),
        )
    } else {
        (
            OfferConfidence::Medium,
            "Tax delinquency on record, verify balance before final offer".to_string(),
        )
    };

    OfferRange {
        low_offer,
        high_offer,
        land_value: Some(land_value),
        acreage,
        discount_low: low,
        discount_high: high,
        price_per_acre_low: per_acre_low,
        price_per_acre_high: per_acre_high,
        justifications,
        confidence,
        confidence_reason,
        warnings,
        can_make_offer: true,
        cannot_offer_reason: None,
    }
}

/// Owner-situation summary line for the buyer-facing sheet.
pub fn owner_situation(parcel: &Parcel, motivation_score: i64) -> String {
    let mut parts: Vec<String> = Vec::new();
    if parcel.is_adjudicated {
        parts.push("Adjudicated property in redemption window".into());
    }
    if parcel.years_tax_delinquent > 0 {
        parts.push(format!(
            "{} years tax delinquent",
            parcel.years_tax_delinquent
        ));
    }
    if motivation_score >= 65 {
        parts.push("Highly motivated seller".into());
    }
    if parts.is_empty() {
        "Off-market land opportunity".into()
    } else {
        parts.join(". ")
    }
}

/// Full deal sheet content, cached by lead id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealSheetContent {
    pub lead_id: i64,
    pub parcel_id: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub county: String,
    pub market_code: String,
    pub acreage: Option<f64>,
    pub land_assessed_value: Option<f64>,

    pub comp_count: i64,
    pub avg_price_per_acre: Option<f64>,
    pub comps_is_estimate: bool,

    pub offer: OfferRange,
    pub recommended_offer: i64,
    pub retail_estimate: f64,
    pub assignment_potential: f64,

    pub is_adjudicated: bool,
    pub years_tax_delinquent: i64,
    pub motivation_score: i64,
    pub owner_situation: String,
    pub ai_description: Option<String>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub generated_at: String,
}

#[derive(Clone)]
pub struct DealSheetService {
    store: Store,
    llm: Option<Arc<LlmClient>>,
    ai_circuit: CircuitBreaker,
    retail_multiplier: f64,
    comps_enabled: bool,
}

impl DealSheetService {
    pub fn new(
        store: Store,
        llm: Option<Arc<LlmClient>>,
        retail_multiplier: f64,
        comps_enabled: bool,
    ) -> Self {
        Self {
            store,
            llm,
            ai_circuit: CircuitBreaker::new("deal_sheet_ai", 3, StdDuration::from_secs(120)),
            retail_multiplier,
            comps_enabled,
        }
    }

    /// Generate (or return the cached) deal sheet for a lead.
    pub async fn generate(
        &self,
        lead_id: i64,
        force_regenerate: bool,
    ) -> Result<Option<DealSheetContent>> {
        let now = Utc::now();
        if !force_regenerate {
            if let Some((content, ai_description)) =
                self.store.get_cached_deal_sheet(lead_id, now).await?
            {
                if let Ok(mut sheet) = serde_json::from_value::<DealSheetContent>(content) {
                    debug!(lead_id, "deal sheet cache hit");
                    sheet.ai_description = ai_description;
                    return Ok(Some(sheet));
                }
            }
        }

        let Some(bundle) = self.store.get_lead_bundle(lead_id).await? else {
            return Ok(None);
        };

        let sheet = self.build(&bundle).await?;
        let content = serde_json::to_value(&sheet)?;
        self.store
            .put_deal_sheet(
                lead_id,
                &content,
                sheet.ai_description.as_deref(),
                now,
                now + Duration::hours(CACHE_HOURS),
            )
            .await?;

        self.store
            .append_timeline_event(
                lead_id,
                "deal_sheet_generated",
                "Deal sheet generated",
                Some(&format!("Retail estimate ${:.0}", sheet.retail_estimate)),
                None,
            )
            .await?;

        Ok(Some(sheet))
    }

    async fn build(&self, bundle: &LeadBundle) -> Result<DealSheetContent> {
        let parcel = &bundle.parcel;
        let offer = compute_offer_range(Some(parcel), DEFAULT_DISCOUNT_LOW, DEFAULT_DISCOUNT_HIGH);

        // Comps summary only when the comps feature is on.
        let (comp_count, avg_ppa) = if self.comps_enabled {
            self.store
                .parish_price_per_acre(&parcel.parish)
                .await
                .unwrap_or((0, None))
        } else {
            (0, None)
        };

        let recommended = offer.midpoint();
        let retail_estimate = recommended as f64 * self.retail_multiplier;
        let assignment_potential = (retail_estimate - offer.high_offer as f64).max(0.0);

        let situation = owner_situation(parcel, bundle.lead.motivation_score);
        let ai_description = self.describe(bundle, &situation).await;

        Ok(DealSheetContent {
            lead_id: bundle.lead.id,
            parcel_id: parcel.canonical_parcel_id.clone(),
            address: parcel.situs_address.clone(),
            city: parcel.city.clone(),
            state: parcel.state.clone(),
            county: parcel.parish.clone(),
            market_code: bundle.lead.market_code.clone(),
            acreage: parcel.lot_size_acres,
            land_assessed_value: parcel.land_assessed_value,
            comp_count,
            avg_price_per_acre: avg_ppa,
            comps_is_estimate: true,
            recommended_offer: recommended,
            retail_estimate,
            assignment_potential,
            offer,
            is_adjudicated: parcel.is_adjudicated,
            years_tax_delinquent: parcel.years_tax_delinquent,
            motivation_score: bundle.lead.motivation_score,
            owner_situation: situation,
            ai_description,
            latitude: parcel.latitude,
            longitude: parcel.longitude,
            generated_at: Utc::now().to_rfc3339(),
        })
    }

    /// Optional AI property description; failures degrade to None.
    async fn describe(&self, bundle: &LeadBundle, situation: &str) -> Option<String> {
        let llm = self.llm.as_deref()?;
        if !self.ai_circuit.can_execute() {
            return None;
        }

        let parcel = &bundle.parcel;
        let acres = parcel
            .lot_size_acres
            .map(|a| format!("{a:.2} acres"))
            .unwrap_or_else(|| "unknown acreage".into());
        let prompt = format!(
            "Write 2 sentences pitching this land deal to an investor. \
             {acres} in {}, {}. {situation}. No prices, no hype words.",
            parcel.parish,
            parcel.state.as_deref().unwrap_or("LA"),
        );

        match llm
            .chat_completion(
                "You write terse, factual land deal descriptions for investors.",
                &prompt,
                120,
                0.5,
                StdDuration::from_secs(30),
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                self.ai_circuit.record_success();
                Some(text.trim().to_string())
            }
            Ok(_) => {
                self.ai_circuit.record_success();
                None
            }
            Err(e) => {
                self.ai_circuit.record_failure();
                warn!(error = %e, "deal sheet ai description failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parcel() -> Parcel {
        Parcel {
            id: 1,
            canonical_parcel_id: "ABC000000000".into(),
            parish: "East Baton Rouge".into(),
            market_code: "LA".into(),
            situs_address: Some("123 Main St".into()),
            city: None,
            state: Some("LA".into()),
            postal_code: None,
            latitude: None,
            longitude: None,
            zoning: None,
            geometry: None,
            land_assessed_value: Some(40_000.0),
            improvement_assessed_value: None,
            lot_size_acres: Some(2.0),
            is_adjudicated: false,
            years_tax_delinquent: 0,
            raw_data: None,
        }
    }

    #[test]
    fn clean_parcel_gets_base_discounts() {
        let offer = compute_offer_range(Some(&parcel()), DEFAULT_DISCOUNT_LOW, DEFAULT_DISCOUNT_HIGH);
        assert!(offer.can_make_offer);
        assert_eq!(offer.low_offer, 22_000);
        assert_eq!(offer.high_offer, 28_000);
        assert_eq!(offer.confidence, OfferConfidence::High);
        assert_eq!(offer.price_per_acre_low, Some(11_000));
        assert!(offer.warnings.is_empty());
    }

    #[test]
    fn missing_acreage_suppresses_per_acre() {
        let mut p = parcel();
        p.lot_size_acres = None;
        let offer = compute_offer_range(Some(&p), DEFAULT_DISCOUNT_LOW, DEFAULT_DISCOUNT_HIGH);

        assert!(offer.can_make_offer);
        assert_eq!(offer.low_offer, 22_000);
        assert_eq!(offer.high_offer, 28_000);
        assert!(offer.price_per_acre_low.is_none());
        assert!(offer.price_per_acre_high.is_none());
        assert!(offer.warnings.iter().any(|w| w == "missing_acreage"));
        assert_eq!(offer.confidence, OfferConfidence::Medium);
    }

    #[test]
    fn no_land_value_means_no_offer() {
        let mut p = parcel();
        p.land_assessed_value = None;
        let offer = compute_offer_range(Some(&p), DEFAULT_DISCOUNT_LOW, DEFAULT_DISCOUNT_HIGH);
        assert!(!offer.can_make_offer);
        assert_eq!(offer.low_offer, 0);
        assert!(offer.cannot_offer_reason.is_some());
        assert_eq!(offer.confidence, OfferConfidence::CannotCompute);

        p.land_assessed_value = Some(0.0);
        let offer = compute_offer_range(Some(&p), DEFAULT_DISCOUNT_LOW, DEFAULT_DISCOUNT_HIGH);
        assert!(!offer.can_make_offer);
        assert!(offer.warnings.iter().any(|w| w == "zero_land_value"));

        let offer = compute_offer_range(None, DEFAULT_DISCOUNT_LOW, DEFAULT_DISCOUNT_HIGH);
        assert!(!offer.can_make_offer);
        assert!(offer.warnings.iter().any(|w| w == "no_parcel_data"));
    }

    #[test]
    fn distress_adjustments_stack_and_clamp() {
        let mut p = parcel();
        p.is_adjudicated = true;
        p.years_tax_delinquent = 8; // capped at -0.10
        let offer = compute_offer_range(Some(&p), DEFAULT_DISCOUNT_LOW, DEFAULT_DISCOUNT_HIGH);

        // 0.55 - 0.15 - 0.10 = 0.30 (at the floor), 0.70 -> 0.45.
        assert!((offer.discount_low - 0.30).abs() < 1e-9);
        assert!((offer.discount_high - 0.45).abs() < 1e-9);
        assert_eq!(offer.low_offer, 12_000);
        assert_eq!(offer.high_offer, 18_000);
        assert!(offer.warnings.iter().any(|w| w == "adjudicated_title_risk"));
        assert!(offer.warnings.iter().any(|w| w == "tax_delinquent"));
    }

    #[test]
    fn small_lot_premium_and_floors() {
        let mut p = parcel();
        p.lot_size_acres = Some(0.5);
        p.land_assessed_value = Some(500.0);
        let offer = compute_offer_range(Some(&p), DEFAULT_DISCOUNT_LOW, DEFAULT_DISCOUNT_HIGH);
        // 500 * 0.60 = 300 -> floored to 500; high 500*0.75=375 -> 1000.
        assert_eq!(offer.low_offer, 500);
        assert_eq!(offer.high_offer, 1_000);
    }

    #[test]
    fn owner_situation_composes_signals() {
        let mut p = parcel();
        p.is_adjudicated = true;
        p.years_tax_delinquent = 3;
        let s = owner_situation(&p, 80);
        assert!(s.contains("Adjudicated"));
        assert!(s.contains("3 years"));
        assert!(s.contains("motivated"));

        let plain = owner_situation(&parcel(), 10);
        assert_eq!(plain, "Off-market land opportunity");
    }
}
