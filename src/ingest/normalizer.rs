//! Key normalization for entity resolution.

use sha2::{Digest, Sha256};

/// Canonical parcel id length used as the stable external key.
pub const PARCEL_ID_LEN: usize = 12;

/// Canonicalize a raw parcel key: strip non-alphanumerics, uppercase,
/// right-pad with `0` to 12 characters, truncate at 12. Idempotent.
pub fn canonical_parcel_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if cleaned.is_empty() {
        return "0".repeat(PARCEL_ID_LEN);
    }

    let mut out: String = cleaned.chars().take(PARCEL_ID_LEN).collect();
    while out.len() < PARCEL_ID_LEN {
        out.push('0');
    }
    out
}

/// Uppercase, whitespace-collapsed owner name for identity hashing.
pub fn normalize_owner_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Party identity hash: SHA-256 of `uppercase(name) + "|" + zip`, hex.
pub fn party_match_hash(name: &str, zip: &str) -> String {
    let normalized = normalize_owner_name(name);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(zip.trim().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parcel_id_is_idempotent_and_fixed_width() {
        let once = canonical_parcel_id("ab-12.3");
        assert_eq!(once, "AB1230000000");
        assert_eq!(once.len(), PARCEL_ID_LEN);
        assert_eq!(canonical_parcel_id(&once), once);

        // Over-long keys truncate at 12.
        let long = canonical_parcel_id("1234567890ABCDEF");
        assert_eq!(long, "1234567890AB");
        assert_eq!(canonical_parcel_id(&long), long);
    }

    #[test]
    fn empty_parcel_id_normalizes_to_zeros() {
        assert_eq!(canonical_parcel_id(""), "000000000000");
        assert_eq!(canonical_parcel_id("--.."), "000000000000");
    }

    #[test]
    fn match_hash_depends_only_on_name_and_zip() {
        let a = party_match_hash("John  Doe", "70801");
        let b = party_match_hash("JOHN DOE", "70801");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, party_match_hash("JOHN DOE", "70802"));
        assert_ne!(a, party_match_hash("JANE DOE", "70801"));
    }
}
