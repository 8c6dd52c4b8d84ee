//! Core domain types shared across the engine.
//!
//! Records mirror store rows one-to-one; relations are integer foreign
//! keys, never owning pointers. Enums carry their wire/database string
//! form via `as_str`/`parse`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lead lifecycle stage.
///
/// CONTACTED, REVIEW, OFFER and CONTRACT are manually-advanced stages:
/// automated scoring never regresses a lead out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Ingested,
    PreScore,
    New,
    Contacted,
    Review,
    Hot,
    Offer,
    Contract,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingested => "INGESTED",
            Self::PreScore => "PRE_SCORE",
            Self::New => "NEW",
            Self::Contacted => "CONTACTED",
            Self::Review => "REVIEW",
            Self::Hot => "HOT",
            Self::Offer => "OFFER",
            Self::Contract => "CONTRACT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INGESTED" => Some(Self::Ingested),
            "PRE_SCORE" => Some(Self::PreScore),
            "NEW" => Some(Self::New),
            "CONTACTED" => Some(Self::Contacted),
            "REVIEW" => Some(Self::Review),
            "HOT" => Some(Self::Hot),
            "OFFER" => Some(Self::Offer),
            "CONTRACT" => Some(Self::Contract),
            _ => None,
        }
    }

    pub fn is_manually_advanced(&self) -> bool {
        matches!(
            self,
            Self::Contacted | Self::Review | Self::Offer | Self::Contract
        )
    }
}

/// Classification of the last inbound reply on a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyClassification {
    Interested,
    NotInterested,
    SendOffer,
    Confused,
    Dead,
}

impl ReplyClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interested => "INTERESTED",
            Self::NotInterested => "NOT_INTERESTED",
            Self::SendOffer => "SEND_OFFER",
            Self::Confused => "CONFUSED",
            Self::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INTERESTED" => Some(Self::Interested),
            "NOT_INTERESTED" => Some(Self::NotInterested),
            "SEND_OFFER" => Some(Self::SendOffer),
            "CONFUSED" => Some(Self::Confused),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }

    /// Classifications that permanently block automated outreach.
    pub fn blocks_outreach(&self) -> bool {
        matches!(self, Self::NotInterested | Self::Dead)
    }
}

/// Outbound message context. Doubles as the idempotency-key context
/// component, so one context per lead per day can exist at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageContext {
    Intro,
    Followup,
    Final,
    /// Compliance acknowledgement (opt-out confirmation etc.).
    Ack,
}

impl MessageContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intro => "intro",
            Self::Followup => "followup",
            Self::Final => "final",
            Self::Ack => "ack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "intro" => Some(Self::Intro),
            "followup" => Some(Self::Followup),
            "final" => Some(Self::Final),
            "ack" => Some(Self::Ack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Sent,
    Failed,
    DryRun,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::DryRun => "dry_run",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "dry_run" => Some(Self::DryRun),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuyerDealStage {
    New,
    DealSent,
    Viewed,
    Responded,
    Closed,
}

impl BuyerDealStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::DealSent => "DEAL_SENT",
            Self::Viewed => "VIEWED",
            Self::Responded => "RESPONDED",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Some(Self::New),
            "DEAL_SENT" => Some(Self::DealSent),
            "VIEWED" => Some(Self::Viewed),
            "RESPONDED" => Some(Self::Responded),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Detected intent of an inbound SMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationIntent {
    Interested,
    NotInterested,
    AskingPrice,
    Negotiating,
    Scheduling,
    Confused,
    Stop,
    WrongNumber,
    Deceased,
    Spam,
    Greeting,
    Question,
}

impl ConversationIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interested => "INTERESTED",
            Self::NotInterested => "NOT_INTERESTED",
            Self::AskingPrice => "ASKING_PRICE",
            Self::Negotiating => "NEGOTIATING",
            Self::Scheduling => "SCHEDULING",
            Self::Confused => "CONFUSED",
            Self::Stop => "STOP",
            Self::WrongNumber => "WRONG_NUMBER",
            Self::Deceased => "DECEASED",
            Self::Spam => "SPAM",
            Self::Greeting => "GREETING",
            Self::Question => "QUESTION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INTERESTED" => Some(Self::Interested),
            "NOT_INTERESTED" => Some(Self::NotInterested),
            "ASKING_PRICE" => Some(Self::AskingPrice),
            "NEGOTIATING" => Some(Self::Negotiating),
            "SCHEDULING" => Some(Self::Scheduling),
            "CONFUSED" => Some(Self::Confused),
            "STOP" => Some(Self::Stop),
            "WRONG_NUMBER" => Some(Self::WrongNumber),
            "DECEASED" => Some(Self::Deceased),
            "SPAM" => Some(Self::Spam),
            "GREETING" => Some(Self::Greeting),
            "QUESTION" => Some(Self::Question),
            _ => None,
        }
    }

    /// Intents that trigger permanent opt-out handling.
    pub fn is_stop_class(&self) -> bool {
        matches!(self, Self::Stop | Self::Deceased | Self::WrongNumber)
    }

    /// Map the conversational intent onto the lead-state enum.
    pub fn lead_classification(&self) -> ReplyClassification {
        match self {
            Self::Interested | Self::Negotiating | Self::Scheduling => {
                ReplyClassification::Interested
            }
            Self::AskingPrice => ReplyClassification::SendOffer,
            Self::NotInterested => ReplyClassification::NotInterested,
            Self::Stop | Self::WrongNumber | Self::Deceased | Self::Spam => {
                ReplyClassification::Dead
            }
            Self::Confused | Self::Greeting | Self::Question => ReplyClassification::Confused,
        }
    }
}

/// Canonical owner identity (deduplicated by match_hash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub id: i64,
    pub normalized_name: String,
    pub normalized_zip: String,
    pub match_hash: String,
    pub display_name: String,
    pub raw_mailing_address: Option<String>,
    pub market_code: String,
}

/// Contact channel bound to a Party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub id: i64,
    pub party_id: i64,
    pub phone_primary: Option<String>,
    pub email: Option<String>,
    pub is_tcpa_safe: bool,
    pub is_dnr: bool,
    pub opt_out: bool,
    pub opt_out_at: Option<DateTime<Utc>>,
}

/// Physical property record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parcel {
    pub id: i64,
    pub canonical_parcel_id: String,
    pub parish: String,
    pub market_code: String,
    pub situs_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub zoning: Option<String>,
    pub geometry: Option<String>,
    pub land_assessed_value: Option<f64>,
    pub improvement_assessed_value: Option<f64>,
    pub lot_size_acres: Option<f64>,
    pub is_adjudicated: bool,
    pub years_tax_delinquent: i64,
    pub raw_data: Option<Value>,
}

/// (Owner x Parcel) with lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub owner_id: i64,
    pub parcel_id: i64,
    pub market_code: String,
    pub motivation_score: i64,
    pub score_details: Option<Value>,
    pub pipeline_stage: PipelineStage,
    pub status: String,
    pub last_reply_classification: Option<ReplyClassification>,
    pub last_reply_at: Option<DateTime<Utc>>,
    pub followup_count: i64,
    pub last_followup_at: Option<DateTime<Utc>>,
    pub next_followup_at: Option<DateTime<Utc>>,
    pub last_alerted_at: Option<DateTime<Utc>>,
    pub send_locked_at: Option<DateTime<Utc>>,
    pub send_locked_by: Option<String>,
    pub tags: Option<Value>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One outbound send record. At most one row per idempotency_key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutreachAttempt {
    pub id: i64,
    pub lead_id: i64,
    pub idempotency_key: Option<String>,
    pub channel: String,
    pub message_body: Option<String>,
    pub message_context: MessageContext,
    pub status: AttemptStatus,
    pub result: Option<String>,
    pub external_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub response_received_at: Option<DateTime<Utc>>,
    pub response_body: Option<String>,
    pub reply_classification: Option<ReplyClassification>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only event log keyed by lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: i64,
    pub lead_id: i64,
    pub event_type: String,
    pub title: String,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Per-market alert sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub market_code: String,
    pub enabled: bool,
    pub hot_score_threshold: i64,
    pub sms_numbers: Vec<String>,
    pub slack_webhook_url: Option<String>,
    pub dedup_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: i64,
    pub task_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub market_code: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerLock {
    pub lock_name: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buyer {
    pub id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub market_codes: Vec<String>,
    pub counties: Vec<String>,
    pub min_acres: Option<f64>,
    pub max_acres: Option<f64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub target_spread: Option<f64>,
    pub vip: bool,
    pub pof_verified: bool,
    pub deals_count: i64,
    pub last_deal_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerDeal {
    pub id: i64,
    pub buyer_id: i64,
    pub lead_id: i64,
    pub stage: BuyerDealStage,
    pub match_score: f64,
    pub blast_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Joined read model assembled per request: a lead plus its owner,
/// parcel and party rows.
#[derive(Debug, Clone, Serialize)]
pub struct LeadBundle {
    pub lead: Lead,
    pub owner: Owner,
    pub parcel: Parcel,
    pub party: Party,
}

impl LeadBundle {
    /// First name for message personalization, "there" as fallback.
    pub fn first_name(&self) -> String {
        self.party
            .display_name
            .split_whitespace()
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("there")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_roundtrip_and_manual_flags() {
        for s in [
            PipelineStage::Ingested,
            PipelineStage::PreScore,
            PipelineStage::New,
            PipelineStage::Contacted,
            PipelineStage::Review,
            PipelineStage::Hot,
            PipelineStage::Offer,
            PipelineStage::Contract,
        ] {
            assert_eq!(PipelineStage::parse(s.as_str()), Some(s));
        }
        assert!(PipelineStage::Contacted.is_manually_advanced());
        assert!(PipelineStage::Contract.is_manually_advanced());
        assert!(!PipelineStage::Hot.is_manually_advanced());
        assert!(!PipelineStage::New.is_manually_advanced());
    }

    #[test]
    fn blocked_classifications() {
        assert!(ReplyClassification::NotInterested.blocks_outreach());
        assert!(ReplyClassification::Dead.blocks_outreach());
        assert!(!ReplyClassification::Interested.blocks_outreach());
        assert!(!ReplyClassification::SendOffer.blocks_outreach());
    }

    #[test]
    fn intent_maps_to_lead_state() {
        assert_eq!(
            ConversationIntent::AskingPrice.lead_classification(),
            ReplyClassification::SendOffer
        );
        assert_eq!(
            ConversationIntent::Stop.lead_classification(),
            ReplyClassification::Dead
        );
        assert_eq!(
            ConversationIntent::Greeting.lead_classification(),
            ReplyClassification::Confused
        );
        assert!(ConversationIntent::WrongNumber.is_stop_class());
        assert!(!ConversationIntent::NotInterested.is_stop_class());
    }
}
