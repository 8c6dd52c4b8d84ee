//! Buyer side of the pipeline: matching, deal sheets, blasts and call
//! preparation.

mod blast;
mod call_prep;
mod deal_sheet;
mod matcher;

pub use blast::{BlastResult, BuyerBlastService, DEFAULT_MAX_BUYERS, DEFAULT_MIN_MATCH_SCORE};
pub use call_prep::{CallPrepService, PrepPack};
pub use deal_sheet::{
    compute_offer_range, owner_situation, DealSheetContent, DealSheetService, OfferConfidence,
    OfferRange, DEFAULT_DISCOUNT_HIGH, DEFAULT_DISCOUNT_LOW,
};
pub use matcher::{score_buyer, BuyerMatch, BuyerMatcher, MatchFactor};
