//! Phone number normalization and SMS eligibility checks.
//!
//! E.164 normalization assumes US (NANP) numbers unless the input
//! already carries a country code. The likely-mobile test is a
//! heuristic: toll-free prefixes are business lines, everything else
//! is assumed textable until a carrier lookup says otherwise.

/// Toll-free prefixes excluded from SMS outreach.
const TOLL_FREE_PREFIXES: &[&str] = &["800", "833", "844", "855", "866", "877", "888"];

#[derive(Debug, Clone, PartialEq)]
pub struct PhoneValidation {
    pub original: String,
    pub e164: Option<String>,
    pub is_valid: bool,
    pub is_mobile: bool,
}

/// Normalize a raw phone string to E.164 (`+1XXXXXXXXXX` for NANP).
///
/// Returns None for anything that cannot be a valid US number.
pub fn normalize_e164(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    let national = match digits.len() {
        10 => digits,
        11 if digits.starts_with('1') => digits[1..].to_string(),
        _ => return None,
    };

    if !is_valid_nanp(&national) {
        return None;
    }

    Some(format!("+1{national}"))
}

/// NANP rules: area code and exchange cannot start with 0 or 1.
fn is_valid_nanp(national: &str) -> bool {
    if national.len() != 10 {
        return false;
    }
    let bytes = national.as_bytes();
    let area_lead = bytes[0];
    let exchange_lead = bytes[3];
    !matches!(area_lead, b'0' | b'1') && !matches!(exchange_lead, b'0' | b'1')
}

/// Toll-free numbers are business lines, never SMS targets.
pub fn is_toll_free(e164: &str) -> bool {
    let national = e164.trim_start_matches('+').trim_start_matches('1');
    TOLL_FREE_PREFIXES
        .iter()
        .any(|p| national.starts_with(p))
}

pub fn is_likely_mobile(e164: &str) -> bool {
    !is_toll_free(e164)
}

pub fn validate_for_sms(raw: &str) -> PhoneValidation {
    match normalize_e164(raw) {
        Some(e164) => {
            let mobile = is_likely_mobile(&e164);
            PhoneValidation {
                original: raw.to_string(),
                e164: Some(e164),
                is_valid: true,
                is_mobile: mobile,
            }
        }
        None => PhoneValidation {
            original: raw.to_string(),
            e164: None,
            is_valid: false,
            is_mobile: false,
        },
    }
}

/// The TCPA gate: valid E.164 and likely mobile.
pub fn is_tcpa_safe(raw: &str) -> bool {
    let v = validate_for_sms(raw);
    v.is_valid && v.is_mobile
}
