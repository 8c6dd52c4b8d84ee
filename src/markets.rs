//! Static per-market configuration.
//!
//! Outreach windows are market-local; each entry carries the IANA zone
//! the window hours are interpreted in.

/// Configuration for one market (state-level territory).
#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub code: &'static str,
    pub name: &'static str,
    pub default_parish: &'static str,
    pub timezone: &'static str,

    pub min_motivation_score: i64,
    pub hot_score_threshold: i64,

    pub outreach_window_start: u32,
    pub outreach_window_end: u32,

    pub followup_day_1: i64,
    pub followup_day_2: i64,
    pub max_followups: i64,

    pub alerts_enabled: bool,
}

const DEFAULT_WINDOW_START: u32 = 9;
const DEFAULT_WINDOW_END: u32 = 18;

pub const MARKETS: &[MarketConfig] = &[
    MarketConfig {
        code: "LA",
        name: "Louisiana",
        default_parish: "East Baton Rouge",
        timezone: "America/Chicago",
        min_motivation_score: 45,
        hot_score_threshold: 75,
        outreach_window_start: DEFAULT_WINDOW_START,
        outreach_window_end: DEFAULT_WINDOW_END,
        followup_day_1: 3,
        followup_day_2: 7,
        max_followups: 4,
        alerts_enabled: true,
    },
    MarketConfig {
        code: "TX",
        name: "Texas",
        default_parish: "Harris County",
        timezone: "America/Chicago",
        min_motivation_score: 40,
        hot_score_threshold: 70,
        outreach_window_start: DEFAULT_WINDOW_START,
        outreach_window_end: DEFAULT_WINDOW_END,
        followup_day_1: 3,
        followup_day_2: 7,
        max_followups: 4,
        alerts_enabled: true,
    },
    MarketConfig {
        code: "MS",
        name: "Mississippi",
        default_parish: "Hinds County",
        timezone: "America/Chicago",
        min_motivation_score: 45,
        hot_score_threshold: 75,
        outreach_window_start: DEFAULT_WINDOW_START,
        outreach_window_end: DEFAULT_WINDOW_END,
        followup_day_1: 3,
        followup_day_2: 7,
        max_followups: 4,
        alerts_enabled: true,
    },
    MarketConfig {
        code: "AR",
        name: "Arkansas",
        default_parish: "Pulaski County",
        timezone: "America/Chicago",
        min_motivation_score: 45,
        hot_score_threshold: 75,
        outreach_window_start: DEFAULT_WINDOW_START,
        outreach_window_end: DEFAULT_WINDOW_END,
        followup_day_1: 3,
        followup_day_2: 7,
        max_followups: 4,
        alerts_enabled: true,
    },
    MarketConfig {
        code: "AL",
        name: "Alabama",
        default_parish: "Jefferson County",
        timezone: "America/Chicago",
        min_motivation_score: 45,
        hot_score_threshold: 75,
        outreach_window_start: DEFAULT_WINDOW_START,
        outreach_window_end: DEFAULT_WINDOW_END,
        followup_day_1: 3,
        followup_day_2: 7,
        max_followups: 4,
        alerts_enabled: true,
    },
];

/// Followup intervals in days, indexed by current followup_count
/// (clamped to the last entry).
pub const FOLLOWUP_INTERVALS: &[i64] = &[3, 7, 14, 30];

/// Followups stop once a lead has received this many.
pub const MAX_FOLLOWUPS: i64 = 4;

/// Look up a market; unknown codes fall back to the first entry (LA).
pub fn market_config(code: &str) -> &'static MarketConfig {
    let upper = code.trim().to_ascii_uppercase();
    MARKETS
        .iter()
        .find(|m| m.code == upper)
        .unwrap_or(&MARKETS[0])
}

pub fn is_valid_market(code: &str) -> bool {
    let upper = code.trim().to_ascii_uppercase();
    MARKETS.iter().any(|m| m.code == upper)
}

/// Interval before the next followup given how many have been sent.
pub fn followup_interval_days(followup_count: i64) -> i64 {
    let idx = followup_count.clamp(0, FOLLOWUP_INTERVALS.len() as i64 - 1) as usize;
    FOLLOWUP_INTERVALS[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_market_falls_back_to_la() {
        assert_eq!(market_config("la").code, "LA");
        assert_eq!(market_config("ZZ").code, "LA");
        assert!(is_valid_market("tx"));
        assert!(!is_valid_market("ZZ"));
    }

    #[test]
    fn followup_interval_clamps() {
        assert_eq!(followup_interval_days(0), 3);
        assert_eq!(followup_interval_days(1), 7);
        assert_eq!(followup_interval_days(2), 14);
        assert_eq!(followup_interval_days(3), 30);
        assert_eq!(followup_interval_days(99), 30);
    }
}
