//! Deterministic motivation scoring.
//!
//! A pure function from (parcel, party) into a 0-100 score with a
//! factor breakdown, plus the stage-transition rule applied atomically
//! with the score update. Equal inputs always produce equal output.

use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::config::{ScoreThresholds, ScoringWeights};
use crate::models::{Parcel, Party, PipelineStage};
use crate::store::Store;

/// One scoring factor with its contribution.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreFactor {
    pub factor: &'static str,
    pub points: i64,
    pub triggered: bool,
    pub detail: String,
}

/// Full scoring output for one lead.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub motivation_score: i64,
    pub factors: Vec<ScoreFactor>,
    pub disqualified: bool,
    pub disqualified_reason: Option<String>,
}

impl ScoreBreakdown {
    /// Structured form persisted on the lead row.
    pub fn to_details(&self) -> serde_json::Value {
        json!({
            "motivation_score": self.motivation_score,
            "components": self.factors.iter()
                .filter(|f| f.triggered)
                .map(|f| (f.factor, f.points))
                .collect::<std::collections::BTreeMap<_, _>>(),
            "factors": self.factors,
            "disqualified": self.disqualified,
            "disqualified_reason": self.disqualified_reason,
        })
    }
}

/// Pure scoring function over (parcel, party).
pub fn compute_score(
    parcel: &Parcel,
    party: &Party,
    weights: &ScoringWeights,
    thresholds: &ScoreThresholds,
) -> ScoreBreakdown {
    let mut factors = Vec::with_capacity(5);
    let mut score: i64 = 0;

    // Adjudicated parcels are the strongest signal.
    let adjudicated = parcel.is_adjudicated;
    if adjudicated {
        score += weights.adjudicated;
    }
    factors.push(ScoreFactor {
        factor: "adjudicated",
        points: if adjudicated { weights.adjudicated } else { 0 },
        triggered: adjudicated,
        detail: if adjudicated {
            "parcel is adjudicated".into()
        } else {
            "not adjudicated".into()
        },
    });

    // Delinquency accrues per year, capped.
    let years = parcel.years_tax_delinquent.max(0);
    let delinquent_points =
        (years * weights.tax_delinquent_per_year).min(weights.tax_delinquent_cap);
    if delinquent_points > 0 {
        score += delinquent_points;
    }
    factors.push(ScoreFactor {
        factor: "tax_delinquent",
        points: delinquent_points,
        triggered: delinquent_points > 0,
        detail: format!("{years} years delinquent"),
    });

    // Low improvement relative to land, or vacant land.
    let low_improvement = match (parcel.improvement_assessed_value, parcel.land_assessed_value) {
        (Some(improvement), Some(land)) if land > 0.0 => improvement < land * 0.10,
        (Some(improvement), _) => improvement == 0.0,
        (None, Some(_)) => true, // no improvement on record: vacant land
        (None, None) => false,
    };
    if low_improvement {
        score += weights.low_improvement;
    }
    factors.push(ScoreFactor {
        factor: "low_improvement",
        points: if low_improvement { weights.low_improvement } else { 0 },
        triggered: low_improvement,
        detail: format!(
            "improvement {:?} vs land {:?}",
            parcel.improvement_assessed_value, parcel.land_assessed_value
        ),
    });

    // Absentee owner: mailing zip differs from situs zip.
    let mailing_zip = party.normalized_zip.trim();
    let situs_zip = parcel.postal_code.as_deref().unwrap_or("").trim();
    let absentee = !mailing_zip.is_empty() && !situs_zip.is_empty() && mailing_zip != situs_zip;
    if absentee {
        score += weights.absentee_owner;
    }
    factors.push(ScoreFactor {
        factor: "absentee_owner",
        points: if absentee { weights.absentee_owner } else { 0 },
        triggered: absentee,
        detail: format!("mailing {mailing_zip} vs situs {situs_zip}"),
    });

    // Flippable lot size window.
    let lot_ideal = parcel
        .lot_size_acres
        .map(|acres| (0.5..=5.0).contains(&acres))
        .unwrap_or(false);
    if lot_ideal {
        score += weights.lot_size_ideal;
    }
    factors.push(ScoreFactor {
        factor: "lot_size_ideal",
        points: if lot_ideal { weights.lot_size_ideal } else { 0 },
        triggered: lot_ideal,
        detail: format!("{:?} acres", parcel.lot_size_acres),
    });

    let score = score.clamp(0, 100);
    let disqualified = score < thresholds.reject;

    ScoreBreakdown {
        motivation_score: score,
        factors,
        disqualified,
        disqualified_reason: disqualified
            .then(|| format!("score {score} below reject threshold {}", thresholds.reject)),
    }
}

/// Stage a freshly-scored lead should land in, ignoring any manual
/// advancement (`>=` tie-break: boundary values take the higher
/// bucket).
pub fn stage_for_score(breakdown: &ScoreBreakdown, thresholds: &ScoreThresholds) -> PipelineStage {
    if breakdown.disqualified {
        PipelineStage::Ingested
    } else if breakdown.motivation_score >= thresholds.hot {
        PipelineStage::Hot
    } else if breakdown.motivation_score >= thresholds.contact {
        PipelineStage::New
    } else {
        PipelineStage::PreScore
    }
}

/// Batch result for a market scoring pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoringRunStats {
    pub scored: usize,
    pub hot: usize,
    pub contact_ready: usize,
    pub disqualified: usize,
    pub average_score: f64,
    pub errors: usize,
}

/// Store-backed scoring service. Scoring never regresses a
/// manually-advanced stage; the score value itself always updates.
pub struct ScoringEngine {
    store: Store,
    weights: ScoringWeights,
    thresholds: ScoreThresholds,
}

impl ScoringEngine {
    pub fn new(store: Store, weights: ScoringWeights, thresholds: ScoreThresholds) -> Self {
        Self {
            store,
            weights,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &ScoreThresholds {
        &self.thresholds
    }

    /// Score one lead, persisting score + details + stage atomically.
    pub async fn score_lead(&self, lead_id: i64) -> anyhow::Result<Option<ScoreBreakdown>> {
        let Some(bundle) = self.store.get_lead_bundle(lead_id).await? else {
            return Ok(None);
        };

        let breakdown = compute_score(
            &bundle.parcel,
            &bundle.party,
            &self.weights,
            &self.thresholds,
        );
        let details = breakdown.to_details();

        if bundle.lead.pipeline_stage.is_manually_advanced() {
            // Manual stages are sticky: refresh the number only.
            self.store
                .apply_score_keep_stage(lead_id, breakdown.motivation_score, &details)
                .await?;
        } else {
            let stage = stage_for_score(&breakdown, &self.thresholds);
            self.store
                .apply_score(lead_id, breakdown.motivation_score, &details, stage)
                .await?;
        }

        Ok(Some(breakdown))
    }

    /// Score every non-deleted lead in a market.
    pub async fn score_market(&self, market: &str) -> anyhow::Result<ScoringRunStats> {
        let lead_ids = self.store.leads_for_scoring(market).await?;
        let mut stats = ScoringRunStats::default();
        let mut total: i64 = 0;

        for lead_id in lead_ids {
            match self.score_lead(lead_id).await {
                Ok(Some(breakdown)) => {
                    stats.scored += 1;
                    total += breakdown.motivation_score;
                    if breakdown.disqualified {
                        stats.disqualified += 1;
                    } else if breakdown.motivation_score >= self.thresholds.hot {
                        stats.hot += 1;
                    } else if breakdown.motivation_score >= self.thresholds.contact {
                        stats.contact_ready += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(lead_id, error = %e, "scoring failed");
                    stats.errors += 1;
                }
            }
        }

        if stats.scored > 0 {
            stats.average_score = total as f64 / stats.scored as f64;
        }
        info!(
            market,
            scored = stats.scored,
            hot = stats.hot,
            avg = format!("{:.1}", stats.average_score),
            "scoring pass complete"
        );
        Ok(stats)
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
            situs_address: None,
            city: None,
            state: Some("LA".into()),
            postal_code: Some("70815".into()),
            latitude: None,
            longitude: None,
            zoning: None,
            geometry: None,
            land_assessed_value: Some(40_000.0),
            improvement_assessed_value: Some(0.0),
            lot_size_acres: Some(2.0),
            is_adjudicated: true,
            years_tax_delinquent: 4,
            raw_data: None,
        }
    }

    fn party() -> Party {
        Party {
            id: 1,
            normalized_name: "JOHN DOE".into(),
            normalized_zip: "70801".into(),
            match_hash: "x".into(),
            display_name: "John Doe".into(),
            raw_mailing_address: None,
            market_code: "LA".into(),
        }
    }

    #[test]
    fn full_distress_scores_100_and_goes_hot() {
        // Adjudicated (40) + 4yr delinquent (20) + no improvement (20)
        // + absentee (10) + ideal lot (10) = 100.
        let breakdown = compute_score(
            &parcel(),
            &party(),
            &ScoringWeights::default(),
            &ScoreThresholds::default(),
        );
        assert_eq!(breakdown.motivation_score, 100);
        assert!(!breakdown.disqualified);
        assert_eq!(
            stage_for_score(&breakdown, &ScoreThresholds::default()),
            PipelineStage::Hot
        );
    }

    #[test]
    fn scoring_is_pure() {
        let weights = ScoringWeights::default();
        let thresholds = ScoreThresholds::default();
        let a = compute_score(&parcel(), &party(), &weights, &thresholds);
        let b = compute_score(&parcel(), &party(), &weights, &thresholds);
        assert_eq!(a.motivation_score, b.motivation_score);
        assert_eq!(a.to_details(), b.to_details());
    }

    #[test]
    fn delinquency_is_capped() {
        let mut p = parcel();
        p.is_adjudicated = false;
        p.years_tax_delinquent = 12;
        p.improvement_assessed_value = Some(20_000.0);
        p.lot_size_acres = Some(20.0);
        let breakdown = compute_score(
            &p,
            &party(),
            &ScoringWeights::default(),
            &ScoreThresholds::default(),
        );
        // 12 years x 5 capped at 20, plus absentee 10.
        assert_eq!(breakdown.motivation_score, 30);
    }

    #[test]
    fn threshold_boundary_takes_higher_bucket() {
        let thresholds = ScoreThresholds::default();
        let mut breakdown = compute_score(
            &parcel(),
            &party(),
            &ScoringWeights::default(),
            &thresholds,
        );

        breakdown.motivation_score = thresholds.hot;
        breakdown.disqualified = false;
        assert_eq!(stage_for_score(&breakdown, &thresholds), PipelineStage::Hot);

        breakdown.motivation_score = thresholds.contact;
        assert_eq!(stage_for_score(&breakdown, &thresholds), PipelineStage::New);

        breakdown.motivation_score = thresholds.contact - 1;
        assert_eq!(
            stage_for_score(&breakdown, &thresholds),
            PipelineStage::PreScore
        );
    }

    #[test]
    fn lot_size_boundary() {
        let weights = ScoringWeights::default();
        let thresholds = ScoreThresholds::default();

        let mut p = parcel();
        p.lot_size_acres = Some(5.0);
        let at_boundary = compute_score(&p, &party(), &weights, &thresholds);
        assert!(at_boundary
            .factors
            .iter()
            .any(|f| f.factor == "lot_size_ideal" && f.triggered));

        p.lot_size_acres = Some(5.01);
        let past_boundary = compute_score(&p, &party(), &weights, &thresholds);
        assert!(past_boundary
            .factors
            .iter()
            .all(|f| f.factor != "lot_size_ideal" || !f.triggered));
        assert_eq!(
            at_boundary.motivation_score - past_boundary.motivation_score,
            weights.lot_size_ideal
        );
    }

    #[test]
    fn low_score_is_disqualified() {
        let mut p = parcel();
        p.is_adjudicated = false;
        p.years_tax_delinquent = 0;
        p.improvement_assessed_value = Some(35_000.0);
        p.lot_size_acres = Some(12.0);
        let mut pt = party();
        pt.normalized_zip = "70815".into();

        let breakdown = compute_score(
            &p,
            &pt,
            &ScoringWeights::default(),
            &ScoreThresholds::default(),
        );
        assert_eq!(breakdown.motivation_score, 0);
        assert!(breakdown.disqualified);
        assert_eq!(
            stage_for_score(&breakdown, &ScoreThresholds::default()),
            PipelineStage::Ingested
        );
    }

    #[tokio::test]
    async fn manual_stage_never_regresses() {
        use crate::store::testutil::temp_store;
        use crate::store::IngestParcel;

        let (store, _file) = temp_store();
        let (parcel_id, _) = store
            .upsert_parcel(&IngestParcel {
                canonical_parcel_id: "ABC".into(),
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
            .upsert_party("h", "JOHN DOE", "70801", "John Doe", None, "LA")
            .await
            .unwrap();
        let (owner_id, _) = store
            .ensure_owner(party_id, Some("+12255550147"), None, true)
            .await
            .unwrap();
        let (lead_id, _) = store.upsert_lead(owner_id, parcel_id, "LA").await.unwrap();

        // Operator advanced the lead to OFFER.
        store
            .set_pipeline_stage(lead_id, PipelineStage::Offer)
            .await
            .unwrap();

        let engine = ScoringEngine::new(
            store.clone(),
            ScoringWeights::default(),
            ScoreThresholds::default(),
        );
        let breakdown = engine.score_lead(lead_id).await.unwrap().unwrap();
        assert_eq!(breakdown.motivation_score, 100);

        let lead = store.get_lead(lead_id).await.unwrap().unwrap();
        // Score refreshed, stage untouched.
        assert_eq!(lead.motivation_score, 100);
        assert_eq!(lead.pipeline_stage, PipelineStage::Offer);
    }
}
