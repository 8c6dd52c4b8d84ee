//! Entity resolver: one ingested row into canonical
//! parcel -> party -> owner -> lead rows. Idempotent.

use anyhow::Result;
use tracing::debug;

use super::normalizer::{canonical_parcel_id, normalize_owner_name, party_match_hash};
use crate::phone;
use crate::store::{IngestParcel, Store};

/// One source row after column mapping, before resolution.
#[derive(Debug, Clone, Default)]
pub struct IngestRecord {
    pub raw_parcel_id: String,
    pub parish: String,
    pub market_code: String,

    pub owner_name: Option<String>,
    pub mailing_address: Option<String>,
    pub mailing_zip: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,

    pub situs_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub land_assessed_value: Option<f64>,
    pub improvement_assessed_value: Option<f64>,
    pub lot_size_acres: Option<f64>,
    pub is_adjudicated: Option<bool>,
    pub years_tax_delinquent: Option<i64>,
    pub raw_data: Option<serde_json::Value>,
}

/// Counters for one resolved row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub created_parcel: bool,
    pub created_party: bool,
    pub created_owner: bool,
    pub created_lead: bool,
    pub lead_id: Option<i64>,
}

/// Resolves source rows into canonical entities via the upsert
/// protocol: parcel by canonical id, party by match hash, single owner
/// per party, lead per (owner, parcel).
pub struct EntityResolver {
    store: Store,
}

impl EntityResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, record: &IngestRecord) -> Result<UpsertStats> {
        let mut stats = UpsertStats::default();

        let parcel_key = canonical_parcel_id(&record.raw_parcel_id);
        let (parcel_id, parcel_created) = self
            .store
            .upsert_parcel(&IngestParcel {
                canonical_parcel_id: parcel_key.clone(),
                parish: record.parish.clone(),
                market_code: record.market_code.clone(),
                situs_address: record.situs_address.clone(),
                city: record.city.clone(),
                state: record.state.clone(),
                postal_code: record.postal_code.clone(),
                land_assessed_value: record.land_assessed_value,
                improvement_assessed_value: record.improvement_assessed_value,
                lot_size_acres: record.lot_size_acres,
                is_adjudicated: record.is_adjudicated,
                years_tax_delinquent: record.years_tax_delinquent,
                raw_data: record.raw_data.clone(),
                ..Default::default()
            })
            .await?;
        stats.created_parcel = parcel_created;

        // No owner on the row: keep the parcel, skip party/lead.
        let Some(owner_name) = record
            .owner_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            debug!(parcel = %parcel_key, "row has no owner name, parcel only");
            return Ok(stats);
        };

        let zip = record.mailing_zip.as_deref().unwrap_or("").trim();
        let hash = party_match_hash(owner_name, zip);
        let (party_id, party_created) = self
            .store
            .upsert_party(
                &hash,
                &normalize_owner_name(owner_name),
                zip,
                owner_name,
                record.mailing_address.as_deref(),
                &record.market_code,
            )
            .await?;
        stats.created_party = party_created;

        // TCPA-safe only when the phone normalizes to E.164 AND passes
        // the likely-mobile test.
        let validation = record
            .phone
            .as_deref()
            .map(phone::validate_for_sms);
        let (phone_e164, tcpa_safe) = match validation {
            Some(v) if v.is_valid => (v.e164, v.is_mobile),
            _ => (None, false),
        };

        let (owner_id, owner_created) = self
            .store
            .ensure_owner(
                party_id,
                phone_e164.as_deref(),
                record.email.as_deref(),
                tcpa_safe,
            )
            .await?;
        stats.created_owner = owner_created;

        let (lead_id, lead_created) = self
            .store
            .upsert_lead(owner_id, parcel_id, &record.market_code)
            .await?;
        stats.created_lead = lead_created;
        stats.lead_id = Some(lead_id);

        Ok(stats)
    }
}
