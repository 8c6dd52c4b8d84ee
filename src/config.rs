//! Environment-driven configuration.
//!
//! Every option has a safe default so a bare process boots in dry-run
//! mode. Validation failures are fatal at startup (exit code 1).

use anyhow::{bail, Result};
use std::env;

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON" | "yes"))
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

/// Scoring weights, overridable per deployment.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub adjudicated: i64,
    pub tax_delinquent_per_year: i64,
    pub tax_delinquent_cap: i64,
    pub low_improvement: i64,
    pub absentee_owner: i64,
    pub lot_size_ideal: i64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            adjudicated: 40,
            tax_delinquent_per_year: 5,
            tax_delinquent_cap: 20,
            low_improvement: 20,
            absentee_owner: 10,
            lot_size_ideal: 10,
        }
    }
}

/// Score thresholds. Boundary values land in the higher bucket (`>=`).
#[derive(Debug, Clone, Copy)]
pub struct ScoreThresholds {
    pub reject: i64,
    pub contact: i64,
    pub hot: i64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            reject: 30,
            contact: 45,
            hot: 65,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub dry_run: bool,

    pub thresholds: ScoreThresholds,
    pub weights: ScoringWeights,

    pub outreach_cooldown_days: i64,
    pub max_sms_per_day: i64,
    pub sms_batch_size: i64,
    pub enrichment_batch_size: i64,
    pub followup_batch_size: i64,

    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_from_number: Option<String>,
    pub twilio_messaging_service_sid: Option<String>,
    pub twilio_status_callback_url: Option<String>,
    pub twilio_max_messages_per_second: f64,

    pub alert_dedup_hours: i64,

    pub openrouter_api_key: Option<String>,
    pub llm_model: String,

    pub retail_multiplier: f64,
    pub markets: Vec<String>,
    pub public_base_url: Option<String>,
    pub nightly_hour_utc: u32,
    /// Directory holding per-market ingestion drops
    /// (`<dir>/<market>/tax_roll.csv` etc). Ingestion is skipped when
    /// unset.
    pub data_dir: Option<String>,

    // Feature flags for optional enrichment providers.
    pub enable_usps: bool,
    pub enable_google: bool,
    pub enable_comps: bool,
    pub enable_propstream: bool,
    pub enable_county_scraper: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let thresholds = ScoreThresholds {
            reject: env_i64("REJECT_SCORE_THRESHOLD", 30),
            contact: env_i64("MIN_MOTIVATION_SCORE", 45),
            hot: env_i64("HOT_SCORE_THRESHOLD", 65),
        };

        let markets = env::var("MARKETS")
            .unwrap_or_else(|_| "LA".to_string())
            .split(',')
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>();

        let config = Self {
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "parcelbot.db".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            dry_run: env_bool("DRY_RUN", true),
            thresholds,
            weights: ScoringWeights::default(),
            outreach_cooldown_days: env_i64("OUTREACH_COOLDOWN_DAYS", 7),
            max_sms_per_day: env_i64("MAX_SMS_PER_DAY", 200),
            sms_batch_size: env_i64("SMS_BATCH_SIZE", 25),
            enrichment_batch_size: env_i64("ENRICHMENT_BATCH_SIZE", 100),
            followup_batch_size: env_i64("FOLLOWUP_BATCH_SIZE", 50),
            twilio_account_sid: env_opt("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: env_opt("TWILIO_AUTH_TOKEN"),
            twilio_from_number: env_opt("TWILIO_FROM_NUMBER"),
            twilio_messaging_service_sid: env_opt("TWILIO_MESSAGING_SERVICE_SID"),
            twilio_status_callback_url: env_opt("TWILIO_STATUS_CALLBACK_URL"),
            twilio_max_messages_per_second: env_f64("TWILIO_MAX_MESSAGES_PER_SECOND", 1.0),
            alert_dedup_hours: env_i64("ALERT_DEDUP_HOURS", 24),
            openrouter_api_key: env_opt("OPENROUTER_API_KEY"),
            llm_model: env::var("LLM_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-3.5-haiku".to_string()),
            retail_multiplier: env_f64("RETAIL_MULTIPLIER", 1.4),
            markets,
            public_base_url: env_opt("PUBLIC_BASE_URL"),
            nightly_hour_utc: env_i64("NIGHTLY_HOUR_UTC", 7).clamp(0, 23) as u32,
            data_dir: env_opt("DATA_DIR"),
            enable_usps: env_bool("ENABLE_USPS", false),
            enable_google: env_bool("ENABLE_GOOGLE", false),
            enable_comps: env_bool("ENABLE_COMPS", false),
            enable_propstream: env_bool("ENABLE_PROPSTREAM", false),
            enable_county_scraper: env_bool("ENABLE_COUNTY_SCRAPER", false),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.thresholds.reject > self.thresholds.contact
            || self.thresholds.contact > self.thresholds.hot
        {
            bail!(
                "score thresholds must be ordered reject <= contact <= hot (got {} / {} / {})",
                self.thresholds.reject,
                self.thresholds.contact,
                self.thresholds.hot
            );
        }
        if self.twilio_max_messages_per_second <= 0.0 {
            bail!("TWILIO_MAX_MESSAGES_PER_SECOND must be positive");
        }
        if self.max_sms_per_day < 0 || self.sms_batch_size < 0 {
            bail!("SMS limits must be non-negative");
        }
        if !self.dry_run && !self.twilio_configured() {
            bail!("live mode requires TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN and TWILIO_FROM_NUMBER");
        }
        if self.markets.is_empty() {
            bail!("MARKETS must name at least one market code");
        }
        Ok(())
    }

    pub fn twilio_configured(&self) -> bool {
        self.twilio_account_sid.is_some()
            && self.twilio_auth_token.is_some()
            && (self.twilio_from_number.is_some() || self.twilio_messaging_service_sid.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_dry() {
        // Scoped to names this test owns; config falls back to defaults.
        std::env::remove_var("DRY_RUN");
        let config = Config::from_env().unwrap();
        assert!(config.dry_run);
        assert_eq!(config.thresholds.contact, 45);
        assert_eq!(config.thresholds.hot, 65);
        assert_eq!(config.thresholds.reject, 30);
        assert_eq!(config.weights.adjudicated, 40);
    }

    #[test]
    fn threshold_ordering_enforced() {
        let mut config = Config::from_env().unwrap();
        config.thresholds = ScoreThresholds {
            reject: 80,
            contact: 45,
            hot: 65,
        };
        assert!(config.validate().is_err());
    }
}
