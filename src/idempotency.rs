//! Idempotency keys and the reserve-then-execute protocol.
//!
//! Key derivation is SHA-256 over `lead_id | context | date_key`, so
//! any (lead, context, UTC day) triple maps to exactly one attempt
//! row. The reservation insert and the result update are separate
//! transactions: a crash between them leaves a reserved slot, never a
//! double send.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::models::{MessageContext, OutreachAttempt};
use crate::store::Store;

/// UTC date key (YYYY-MM-DD) for today's sends.
pub fn date_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Key for a lead outreach: SHA-256 hex of `lead_id|context|date`.
pub fn outreach_key(lead_id: i64, context: MessageContext, date: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lead_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(context.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(date.as_bytes());
    hex::encode(hasher.finalize())
}

/// Key for a buyer blast: one per (buyer, lead, day).
pub fn blast_key(lead_id: i64, buyer_id: i64, date: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"buyer_blast|");
    hasher.update(lead_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(buyer_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(date.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of a slot reservation.
#[derive(Debug, Clone)]
pub enum Reservation {
    /// We won the slot; the pending attempt is ours to execute.
    Reserved(OutreachAttempt),
    /// The key already exists; return the prior attempt as-is.
    Duplicate(OutreachAttempt),
}

#[derive(Clone)]
pub struct IdempotencyService {
    store: Store,
}

impl IdempotencyService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Reserve the slot for a key, or surface the existing attempt.
    pub async fn reserve(
        &self,
        lead_id: i64,
        key: &str,
        channel: &str,
        context: MessageContext,
    ) -> Result<Reservation> {
        // Fast path: the key already exists.
        if let Some(existing) = self.store.get_attempt_by_key(key).await? {
            return Ok(Reservation::Duplicate(existing));
        }

        // Insert the pending row; a unique-key collision means another
        // caller won the race between our check and our insert.
        match self
            .store
            .reserve_attempt(lead_id, key, channel, context)
            .await?
        {
            Some(attempt) => Ok(Reservation::Reserved(attempt)),
            None => {
                let existing = self
                    .store
                    .get_attempt_by_key(key)
                    .await?
                    .context("attempt row missing after key collision")?;
                Ok(Reservation::Duplicate(existing))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::store::IngestParcel;
    use chrono::TimeZone;

    #[test]
    fn keys_are_stable_and_distinct() {
        let date = "2025-01-10";
        let a = outreach_key(42, MessageContext::Followup, date);
        let b = outreach_key(42, MessageContext::Followup, date);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, outreach_key(43, MessageContext::Followup, date));
        assert_ne!(a, outreach_key(42, MessageContext::Intro, date));
        assert_ne!(a, outreach_key(42, MessageContext::Followup, "2025-01-11"));
        assert_ne!(a, blast_key(42, 1, date));
    }

    #[test]
    fn date_key_is_utc_day() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 10, 23, 59, 59).unwrap();
        assert_eq!(date_key(ts), "2025-01-10");
    }

    #[tokio::test]
    async fn reserve_then_duplicate() {
        let (store, _file) = temp_store();
        let (parcel_id, _) = store
            .upsert_parcel(&IngestParcel {
                canonical_parcel_id: "I1".into(),
                parish: "East Baton Rouge".into(),
                market_code: "LA".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let (party_id, _) = store
            .upsert_party("h", "A B", "1", "A B", None, "LA")
            .await
            .unwrap();
        let (owner_id, _) = store.ensure_owner(party_id, None, None, false).await.unwrap();
        let (lead_id, _) = store.upsert_lead(owner_id, parcel_id, "LA").await.unwrap();

        let service = IdempotencyService::new(store.clone());
        let key = outreach_key(lead_id, MessageContext::Followup, "2025-01-10");

        let first = service
            .reserve(lead_id, &key, "sms", MessageContext::Followup)
            .await
            .unwrap();
        let reserved_id = match first {
            Reservation::Reserved(a) => a.id,
            Reservation::Duplicate(_) => panic!("first reserve must win the slot"),
        };

        let second = service
            .reserve(lead_id, &key, "sms", MessageContext::Followup)
            .await
            .unwrap();
        match second {
            Reservation::Duplicate(a) => assert_eq!(a.id, reserved_id),
            Reservation::Reserved(_) => panic!("second reserve must observe the duplicate"),
        }

        // Exactly one row carries the key.
        let counts = store.entity_counts().await.unwrap();
        assert_eq!(counts.outreach_attempts, 1);
    }
}
