//! The TCPA gate: every outbound path validates here first.
//!
//! Blocked sends are a tagged result, not an exception; each code is a
//! stable string the API surfaces verbatim. Opt-out and DNR are never
//! bypassable, not even with the force flag.

use serde::Serialize;

use crate::models::{Lead, Owner};
use crate::phone;

/// Stable failure codes for blocked sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockedCode {
    OptOut,
    Dnr,
    BlockedClassification,
    NoPhone,
    InvalidPhone,
    NotTcpaSafe,
}

impl BlockedCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptOut => "OPT_OUT",
            Self::Dnr => "DNR",
            Self::BlockedClassification => "BLOCKED_CLASSIFICATION",
            Self::NoPhone => "NO_PHONE",
            Self::InvalidPhone => "INVALID_PHONE",
            Self::NotTcpaSafe => "NOT_TCPA_SAFE",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendBlocked {
    pub code: BlockedCode,
    pub reason: String,
}

impl SendBlocked {
    fn new(code: BlockedCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Validate a send, in gate order. On success returns the E.164 number
/// to text.
pub fn validate_can_send(owner: &Owner, lead: &Lead, force: bool) -> Result<String, SendBlocked> {
    // 1. Opt-out: never bypassable.
    if owner.opt_out {
        return Err(SendBlocked::new(
            BlockedCode::OptOut,
            "owner has opted out of communications",
        ));
    }

    // 2. DNR: never bypassable.
    if owner.is_dnr {
        return Err(SendBlocked::new(
            BlockedCode::Dnr,
            "owner is on the do-not-reach list",
        ));
    }

    // 3. Blocked reply classification, unless forced.
    if let Some(classification) = lead.last_reply_classification {
        if classification.blocks_outreach() && !force {
            return Err(SendBlocked::new(
                BlockedCode::BlockedClassification,
                format!("lead classified as {}", classification.as_str()),
            ));
        }
    }

    // 4. A phone must exist.
    let Some(raw_phone) = owner
        .phone_primary
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return Err(SendBlocked::new(BlockedCode::NoPhone, "owner has no phone number"));
    };

    // 5. It must normalize and look textable.
    let validation = phone::validate_for_sms(raw_phone);
    let Some(e164) = validation.e164 else {
        return Err(SendBlocked::new(
            BlockedCode::InvalidPhone,
            format!("phone does not normalize to E.164: {raw_phone}"),
        ));
    };
    if !validation.is_mobile {
        return Err(SendBlocked::new(
            BlockedCode::NotTcpaSafe,
            "phone fails the likely-mobile check",
        ));
    }

    Ok(e164)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PipelineStage, ReplyClassification};
    use chrono::Utc;

    fn owner() -> Owner {
        Owner {
            id: 1,
            party_id: 1,
            phone_primary: Some("(225) 555-0147".into()),
            email: None,
            is_tcpa_safe: true,
            is_dnr: false,
            opt_out: false,
            opt_out_at: None,
        }
    }

    fn lead() -> Lead {
        let now = Utc::now();
        Lead {
            id: 42,
            owner_id: 1,
            parcel_id: 1,
            market_code: "LA".into(),
            motivation_score: 90,
            score_details: None,
            pipeline_stage: PipelineStage::New,
            status: "new".into(),
            last_reply_classification: None,
            last_reply_at: None,
            followup_count: 0,
            last_followup_at: None,
            next_followup_at: None,
            last_alerted_at: None,
            send_locked_at: None,
            send_locked_by: None,
            tags: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn valid_lead_passes_and_normalizes() {
        let e164 = validate_can_send(&owner(), &lead(), false).unwrap();
        assert_eq!(e164, "+12255550147");
    }

    #[test]
    fn opt_out_blocks_even_with_force() {
        let mut o = owner();
        o.opt_out = true;
        let blocked = validate_can_send(&o, &lead(), true).unwrap_err();
        assert_eq!(blocked.code, BlockedCode::OptOut);
        assert_eq!(blocked.code.as_str(), "OPT_OUT");
    }

    #[test]
    fn dnr_blocks_even_with_force() {
        let mut o = owner();
        o.is_dnr = true;
        let blocked = validate_can_send(&o, &lead(), true).unwrap_err();
        assert_eq!(blocked.code, BlockedCode::Dnr);
    }

    #[test]
    fn blocked_classification_respects_force() {
        let mut l = lead();
        l.last_reply_classification = Some(ReplyClassification::NotInterested);

        let blocked = validate_can_send(&owner(), &l, false).unwrap_err();
        assert_eq!(blocked.code, BlockedCode::BlockedClassification);

        // force bypasses classification, not compliance flags.
        assert!(validate_can_send(&owner(), &l, true).is_ok());
    }

    #[test]
    fn phone_gates() {
        let mut o = owner();
        o.phone_primary = None;
        assert_eq!(
            validate_can_send(&o, &lead(), false).unwrap_err().code,
            BlockedCode::NoPhone
        );

        o.phone_primary = Some("not a phone".into());
        assert_eq!(
            validate_can_send(&o, &lead(), false).unwrap_err().code,
            BlockedCode::InvalidPhone
        );

        o.phone_primary = Some("800-555-0147".into());
        assert_eq!(
            validate_can_send(&o, &lead(), false).unwrap_err().code,
            BlockedCode::NotTcpaSafe
        );
    }
}
