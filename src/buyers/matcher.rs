//! Buyer-to-lead match scoring.
//!
//! Fixed weighted rubric totalling 100. Results are ordered VIP first,
//! then by total score.

use anyhow::Result;
use serde::Serialize;

use crate::models::{Buyer, LeadBundle};
use crate::store::Store;

pub const WEIGHT_MARKET: f64 = 25.0;
pub const WEIGHT_COUNTY: f64 = 20.0;
pub const WEIGHT_ACREAGE: f64 = 15.0;
pub const WEIGHT_BUDGET: f64 = 15.0;
pub const WEIGHT_VIP: f64 = 10.0;
pub const WEIGHT_POF: f64 = 10.0;
pub const WEIGHT_SPREAD: f64 = 5.0;

const MAX_POSSIBLE: f64 = WEIGHT_MARKET
    + WEIGHT_COUNTY
    + WEIGHT_ACREAGE
    + WEIGHT_BUDGET
    + WEIGHT_VIP
    + WEIGHT_POF
    + WEIGHT_SPREAD;

#[derive(Debug, Clone, Serialize)]
pub struct MatchFactor {
    pub factor: &'static str,
    pub score: f64,
    pub max_score: f64,
    pub matched: bool,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuyerMatch {
    pub buyer_id: i64,
    pub buyer_name: String,
    pub buyer_phone: Option<String>,
    pub buyer_email: Option<String>,
    pub vip: bool,
    pub pof_verified: bool,
    pub total_score: f64,
    pub match_percentage: f64,
    pub factors: Vec<MatchFactor>,
}

/// Score one buyer against a lead. Pure.
pub fn score_buyer(
    buyer: &Buyer,
    market: &str,
    county: Option<&str>,
    acreage: Option<f64>,
    offer_price: Option<f64>,
) -> BuyerMatch {
    let mut factors = Vec::with_capacity(7);
    let mut total = 0.0;

    // Market match.
    let market_matched = buyer
        .market_codes
        .iter()
        .any(|m| m.eq_ignore_ascii_case(market));
    push(
        &mut factors,
        &mut total,
        "market",
        WEIGHT_MARKET,
        market_matched,
        format!("buyer markets: {:?}", buyer.market_codes),
    );

    // County match: no preference means any county qualifies;
    // otherwise contains-in-either-direction, case-insensitive.
    let county_matched = if buyer.counties.is_empty() {
        true
    } else {
        match county {
            Some(county) => {
                let lead_county = county.to_uppercase();
                buyer.counties.iter().any(|c| {
                    let c = c.to_uppercase();
                    c.contains(&lead_county) || lead_county.contains(&c)
                })
            }
            None => false,
        }
    };
    push(
        &mut factors,
        &mut total,
        "county",
        WEIGHT_COUNTY,
        county_matched,
        format!("buyer counties: {:?}", buyer.counties),
    );

    // Acreage in range. Unknown acreage reads as zero.
    let acres = acreage.unwrap_or(0.0);
    let acreage_matched = buyer.min_acres.map_or(true, |min| acres >= min)
        && buyer.max_acres.map_or(true, |max| acres <= max);
    push(
        &mut factors,
        &mut total,
        "acreage",
        WEIGHT_ACREAGE,
        acreage_matched,
        format!("{acres:.2} ac vs {:?}-{:?}", buyer.min_acres, buyer.max_acres),
    );

    // Budget in range; no offer price to compare counts as in-budget.
    let budget_matched = match offer_price {
        Some(offer) => {
            buyer.price_min.map_or(true, |min| offer >= min)
                && buyer.price_max.map_or(true, |max| offer <= max)
        }
        None => true,
    };
    push(
        &mut factors,
        &mut total,
        "budget",
        WEIGHT_BUDGET,
        budget_matched,
        format!("offer {offer_price:?} vs {:?}-{:?}", buyer.price_min, buyer.price_max),
    );

    push(
        &mut factors,
        &mut total,
        "vip",
        WEIGHT_VIP,
        buyer.vip,
        if buyer.vip { "VIP buyer" } else { "standard buyer" }.to_string(),
    );
    push(
        &mut factors,
        &mut total,
        "pof_verified",
        WEIGHT_POF,
        buyer.pof_verified,
        if buyer.pof_verified { "POF on file" } else { "no POF" }.to_string(),
    );

    // Spread compatibility: no target means compatible.
    let spread_matched = buyer.target_spread.is_none() || offer_price.is_some();
    push(
        &mut factors,
        &mut total,
        "spread",
        WEIGHT_SPREAD,
        spread_matched,
        format!("target spread {:?}", buyer.target_spread),
    );

    BuyerMatch {
        buyer_id: buyer.id,
        buyer_name: buyer.name.clone(),
        buyer_phone: buyer.phone.clone(),
        buyer_email: buyer.email.clone(),
        vip: buyer.vip,
        pof_verified: buyer.pof_verified,
        total_score: total,
        match_percentage: total / MAX_POSSIBLE * 100.0,
        factors,
    }
}

fn push(
    factors: &mut Vec<MatchFactor>,
    total: &mut f64,
    factor: &'static str,
    weight: f64,
    matched: bool,
    details: String,
) {
    let score = if matched { weight } else { 0.0 };
    *total += score;
    factors.push(MatchFactor {
        factor,
        score,
        max_score: weight,
        matched,
        details,
    });
}

#[derive(Clone)]
pub struct BuyerMatcher {
    store: Store,
}

impl BuyerMatcher {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Rank buyers for a lead: filter by minimum match percentage,
    /// order VIP first then score, cap at `limit`.
    pub async fn match_buyers(
        &self,
        bundle: &LeadBundle,
        offer_price: Option<f64>,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<BuyerMatch>> {
        let buyers = self.store.list_buyers().await?;
        let mut matches: Vec<BuyerMatch> = buyers
            .iter()
            .map(|buyer| {
                score_buyer(
                    buyer,
                    &bundle.lead.market_code,
                    Some(bundle.parcel.parish.as_str()),
                    bundle.parcel.lot_size_acres,
                    offer_price,
                )
            })
            .filter(|m| m.match_percentage >= min_score)
            .collect();

        matches.sort_by(|a, b| {
            b.vip
                .cmp(&a.vip)
                .then(b.total_score.total_cmp(&a.total_score))
        });
        matches.truncate(limit);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buyer() -> Buyer {
        Buyer {
            id: 1,
            name: "B1".into(),
            phone: Some("+15125550100".into()),
            email: None,
            market_codes: vec!["LA".into()],
            counties: vec!["East Baton Rouge".into()],
            min_acres: Some(1.0),
            max_acres: Some(5.0),
            price_min: Some(10_000.0),
            price_max: Some(30_000.0),
            target_spread: None,
            vip: true,
            pof_verified: true,
            deals_count: 0,
            last_deal_sent_at: None,
        }
    }

    #[test]
    fn perfect_match_is_100_percent() {
        let m = score_buyer(
            &buyer(),
            "LA",
            Some("East Baton Rouge"),
            Some(3.2),
            Some(20_000.0),
        );
        assert_eq!(m.total_score, 100.0);
        assert_eq!(m.match_percentage, 100.0);
        assert!(m.factors.iter().all(|f| f.matched));
    }

    #[test]
    fn out_of_market_loses_market_points() {
        let m = score_buyer(
            &buyer(),
            "TX",
            Some("East Baton Rouge"),
            Some(3.2),
            Some(20_000.0),
        );
        assert_eq!(m.total_score, 100.0 - WEIGHT_MARKET);
    }

    #[test]
    fn county_containment_is_bidirectional() {
        let mut b = buyer();
        b.counties = vec!["Baton Rouge".into()];
        let m = score_buyer(&b, "LA", Some("East Baton Rouge"), Some(3.0), None);
        assert!(m.factors.iter().any(|f| f.factor == "county" && f.matched));

        b.counties = vec!["East Baton Rouge Parish".into()];
        let m = score_buyer(&b, "LA", Some("East Baton Rouge"), Some(3.0), None);
        assert!(m.factors.iter().any(|f| f.factor == "county" && f.matched));
    }

    #[test]
    fn no_county_preference_matches_all() {
        let mut b = buyer();
        b.counties = vec![];
        let m = score_buyer(&b, "LA", Some("Ascension"), Some(3.0), None);
        assert!(m.factors.iter().any(|f| f.factor == "county" && f.matched));
    }

    #[test]
    fn acreage_and_budget_bounds() {
        let m = score_buyer(&buyer(), "LA", Some("East Baton Rouge"), Some(8.0), Some(20_000.0));
        assert!(m.factors.iter().any(|f| f.factor == "acreage" && !f.matched));

        let m = score_buyer(&buyer(), "LA", Some("East Baton Rouge"), Some(3.0), Some(50_000.0));
        assert!(m.factors.iter().any(|f| f.factor == "budget" && !f.matched));

        // Unknown acreage reads as zero, which is below the floor.
        let m = score_buyer(&buyer(), "LA", Some("East Baton Rouge"), None, None);
        assert!(m.factors.iter().any(|f| f.factor == "acreage" && !f.matched));
    }
}
