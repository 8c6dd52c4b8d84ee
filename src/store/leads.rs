//! Lead/owner/party/parcel queries and the per-lead send lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};

use super::{fmt_ts, opt_json, opt_ts, Store};
use crate::models::{
    Lead, LeadBundle, Owner, Parcel, Party, PipelineStage, ReplyClassification,
};

/// Incoming parcel fields from an ingestion row. Merge semantics:
/// non-null incoming fields fill null existing fields; assessed values
/// overwrite whenever present and > 0.
#[derive(Debug, Clone, Default)]
pub struct IngestParcel {
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
    pub is_adjudicated: Option<bool>,
    pub years_tax_delinquent: Option<i64>,
    pub raw_data: Option<serde_json::Value>,
}

/// Lead listing filters for the HTTP surface.
#[derive(Debug, Clone, Default)]
pub struct LeadFilter {
    pub market: Option<String>,
    pub stage: Option<PipelineStage>,
    pub min_score: Option<i64>,
    pub tcpa_safe_only: bool,
    pub limit: i64,
    pub offset: i64,
}

const LEAD_COLS: &str = "id, owner_id, parcel_id, market_code, motivation_score, score_details, \
     pipeline_stage, status, last_reply_classification, last_reply_at, followup_count, \
     last_followup_at, next_followup_at, last_alerted_at, send_locked_at, send_locked_by, \
     tags, deleted_at, created_at, updated_at";

const PARCEL_COLS: &str = "id, canonical_parcel_id, parish, market_code, situs_address, city, state, \
     postal_code, latitude, longitude, zoning, geometry, land_assessed_value, \
     improvement_assessed_value, lot_size_acres, is_adjudicated, years_tax_delinquent, raw_data";

const OWNER_COLS: &str =
    "id, party_id, phone_primary, email, is_tcpa_safe, is_dnr, opt_out, opt_out_at";

const PARTY_COLS: &str = "id, normalized_name, normalized_zip, match_hash, display_name, \
     raw_mailing_address, market_code";

pub(crate) fn lead_from_row(row: &Row<'_>) -> rusqlite::Result<Lead> {
    let stage: String = row.get(6)?;
    let classification: Option<String> = row.get(8)?;
    Ok(Lead {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        parcel_id: row.get(2)?,
        market_code: row.get(3)?,
        motivation_score: row.get(4)?,
        score_details: opt_json(row.get(5)?),
        pipeline_stage: PipelineStage::parse(&stage).unwrap_or(PipelineStage::Ingested),
        status: row.get(7)?,
        last_reply_classification: classification
            .as_deref()
            .and_then(ReplyClassification::parse),
        last_reply_at: opt_ts(row.get(9)?),
        followup_count: row.get(10)?,
        last_followup_at: opt_ts(row.get(11)?),
        next_followup_at: opt_ts(row.get(12)?),
        last_alerted_at: opt_ts(row.get(13)?),
        send_locked_at: opt_ts(row.get(14)?),
        send_locked_by: row.get(15)?,
        tags: opt_json(row.get(16)?),
        deleted_at: opt_ts(row.get(17)?),
        created_at: super::parse_ts(&row.get::<_, String>(18)?),
        updated_at: super::parse_ts(&row.get::<_, String>(19)?),
    })
}

pub(crate) fn parcel_from_row(row: &Row<'_>) -> rusqlite::Result<Parcel> {
    Ok(Parcel {
        id: row.get(0)?,
        canonical_parcel_id: row.get(1)?,
        parish: row.get(2)?,
        market_code: row.get(3)?,
        situs_address: row.get(4)?,
        city: row.get(5)?,
        state: row.get(6)?,
        postal_code: row.get(7)?,
        latitude: row.get(8)?,
        longitude: row.get(9)?,
        zoning: row.get(10)?,
        geometry: row.get(11)?,
        land_assessed_value: row.get(12)?,
        improvement_assessed_value: row.get(13)?,
        lot_size_acres: row.get(14)?,
        is_adjudicated: row.get::<_, i64>(15)? != 0,
        years_tax_delinquent: row.get(16)?,
        raw_data: opt_json(row.get(17)?),
    })
}

pub(crate) fn owner_from_row(row: &Row<'_>) -> rusqlite::Result<Owner> {
    Ok(Owner {
        id: row.get(0)?,
        party_id: row.get(1)?,
        phone_primary: row.get(2)?,
        email: row.get(3)?,
        is_tcpa_safe: row.get::<_, i64>(4)? != 0,
        is_dnr: row.get::<_, i64>(5)? != 0,
        opt_out: row.get::<_, i64>(6)? != 0,
        opt_out_at: opt_ts(row.get(7)?),
    })
}

pub(crate) fn party_from_row(row: &Row<'_>) -> rusqlite::Result<Party> {
    Ok(Party {
        id: row.get(0)?,
        normalized_name: row.get(1)?,
        normalized_zip: row.get(2)?,
        match_hash: row.get(3)?,
        display_name: row.get(4)?,
        raw_mailing_address: row.get(5)?,
        market_code: row.get(6)?,
    })
}

impl Store {
    // ------------------------------------------------------------------
    // Parcels
    // ------------------------------------------------------------------

    pub async fn get_parcel_by_canonical_id(&self, canonical: &str) -> Result<Option<Parcel>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PARCEL_COLS} FROM parcels WHERE canonical_parcel_id = ?1"
        ))?;
        let mut rows = stmt.query(params![canonical])?;
        match rows.next()? {
            Some(row) => Ok(Some(parcel_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_parcel(&self, id: i64) -> Result<Option<Parcel>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {PARCEL_COLS} FROM parcels WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(parcel_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Insert or merge a parcel by canonical id. Returns (id, created).
    pub async fn upsert_parcel(&self, incoming: &IngestParcel) -> Result<(i64, bool)> {
        let existing = self
            .get_parcel_by_canonical_id(&incoming.canonical_parcel_id)
            .await?;
        let conn = self.lock().await;
        let now = fmt_ts(Utc::now());

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO parcels (canonical_parcel_id, parish, market_code, situs_address, \
                     city, state, postal_code, latitude, longitude, zoning, geometry, \
                     land_assessed_value, improvement_assessed_value, lot_size_acres, \
                     is_adjudicated, years_tax_delinquent, raw_data, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                    params![
                        incoming.canonical_parcel_id,
                        incoming.parish,
                        incoming.market_code,
                        incoming.situs_address,
                        incoming.city,
                        incoming.state,
                        incoming.postal_code,
                        incoming.latitude,
                        incoming.longitude,
                        incoming.zoning,
                        incoming.geometry,
                        incoming.land_assessed_value,
                        incoming.improvement_assessed_value,
                        incoming.lot_size_acres,
                        incoming.is_adjudicated.unwrap_or(false) as i64,
                        incoming.years_tax_delinquent.unwrap_or(0),
                        incoming.raw_data.as_ref().map(|v| v.to_string()),
                        now,
                    ],
                )
                .context("insert parcel")?;
                Ok((conn.last_insert_rowid(), true))
            }
            Some(current) => {
                // Field-level merge: fill nulls, overwrite assessed
                // values when the incoming figure is present and > 0.
                let situs = current.situs_address.or_else(|| incoming.situs_address.clone());
                let city = current.city.or_else(|| incoming.city.clone());
                let state = current.state.or_else(|| incoming.state.clone());
                let postal = current.postal_code.or_else(|| incoming.postal_code.clone());
                let lat = current.latitude.or(incoming.latitude);
                let lng = current.longitude.or(incoming.longitude);
                let zoning = current.zoning.or_else(|| incoming.zoning.clone());
                let geometry = current.geometry.or_else(|| incoming.geometry.clone());
                let land = match incoming.land_assessed_value {
                    Some(v) if v > 0.0 => Some(v),
                    _ => current.land_assessed_value,
                };
                let improvement = match incoming.improvement_assessed_value {
                    Some(v) => Some(v),
                    None => current.improvement_assessed_value,
                };
                let acres = current.lot_size_acres.or(incoming.lot_size_acres);
                let adjudicated =
                    incoming.is_adjudicated.unwrap_or(current.is_adjudicated);
                let years = incoming
                    .years_tax_delinquent
                    .unwrap_or(current.years_tax_delinquent);

                conn.execute(
                    "UPDATE parcels SET parish = ?2, situs_address = ?3, city = ?4, state = ?5, \
                     postal_code = ?6, latitude = ?7, longitude = ?8, zoning = ?9, geometry = ?10, \
                     land_assessed_value = ?11, improvement_assessed_value = ?12, \
                     lot_size_acres = ?13, is_adjudicated = ?14, years_tax_delinquent = ?15 \
                     WHERE id = ?1",
                    params![
                        current.id,
                        incoming.parish,
                        situs,
                        city,
                        state,
                        postal,
                        lat,
                        lng,
                        zoning,
                        geometry,
                        land,
                        improvement,
                        acres,
                        adjudicated as i64,
                        years,
                    ],
                )
                .context("merge parcel")?;
                Ok((current.id, false))
            }
        }
    }

    pub async fn set_parcel_location(
        &self,
        canonical: &str,
        latitude: f64,
        longitude: f64,
        geometry: Option<&str>,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let updated = conn.execute(
            "UPDATE parcels SET latitude = ?2, longitude = ?3, \
             geometry = COALESCE(?4, geometry) WHERE canonical_parcel_id = ?1",
            params![canonical, latitude, longitude, geometry],
        )?;
        Ok(updated > 0)
    }

    /// Parcels with a situs address on record (verifier work list).
    pub async fn parcels_with_situs(&self, market: &str, limit: i64) -> Result<Vec<Parcel>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PARCEL_COLS} FROM parcels WHERE market_code = ?1 \
             AND situs_address IS NOT NULL ORDER BY id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![market.trim().to_ascii_uppercase(), limit.clamp(1, 10_000)],
            parcel_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Parcels with a situs address but no coordinates (geocoder
    /// work list).
    pub async fn parcels_missing_location(&self, market: &str, limit: i64) -> Result<Vec<Parcel>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PARCEL_COLS} FROM parcels WHERE market_code = ?1 \
             AND (latitude IS NULL OR longitude IS NULL) AND situs_address IS NOT NULL \
             ORDER BY id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![market.trim().to_ascii_uppercase(), limit.clamp(1, 10_000)],
            parcel_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Parcels with no usable assessed land value (property-lookup
    /// work list).
    pub async fn parcels_missing_assessment(&self, market: &str, limit: i64) -> Result<Vec<Parcel>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PARCEL_COLS} FROM parcels WHERE market_code = ?1 \
             AND (land_assessed_value IS NULL OR land_assessed_value <= 0) \
             ORDER BY id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![market.trim().to_ascii_uppercase(), limit.clamp(1, 10_000)],
            parcel_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn update_parcel_situs(&self, parcel_id: i64, situs_address: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE parcels SET situs_address = ?2 WHERE id = ?1",
            params![parcel_id, situs_address],
        )?;
        Ok(())
    }

    /// Fill missing assessment facts from a provider. Existing
    /// non-zero figures always win over looked-up ones.
    pub async fn backfill_parcel_facts(
        &self,
        parcel_id: i64,
        land_assessed_value: Option<f64>,
        improvement_assessed_value: Option<f64>,
        lot_size_acres: Option<f64>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE parcels SET \
             land_assessed_value = CASE \
                 WHEN (land_assessed_value IS NULL OR land_assessed_value <= 0) \
                     AND ?2 IS NOT NULL THEN ?2 \
                 ELSE land_assessed_value END, \
             improvement_assessed_value = CASE \
                 WHEN improvement_assessed_value IS NULL AND ?3 IS NOT NULL THEN ?3 \
                 ELSE improvement_assessed_value END, \
             lot_size_acres = CASE \
                 WHEN lot_size_acres IS NULL AND ?4 IS NOT NULL THEN ?4 \
                 ELSE lot_size_acres END \
             WHERE id = ?1",
            params![
                parcel_id,
                land_assessed_value,
                improvement_assessed_value,
                lot_size_acres,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Parties & owners
    // ------------------------------------------------------------------

    /// Insert or reuse a party by match hash. Returns (id, created).
    pub async fn upsert_party(
        &self,
        match_hash: &str,
        normalized_name: &str,
        normalized_zip: &str,
        display_name: &str,
        raw_mailing_address: Option<&str>,
        market_code: &str,
    ) -> Result<(i64, bool)> {
        let conn = self.lock().await;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM parties WHERE match_hash = ?1",
                params![match_hash],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        if let Some(id) = existing {
            return Ok((id, false));
        }

        conn.execute(
            "INSERT INTO parties (normalized_name, normalized_zip, match_hash, display_name, \
             raw_mailing_address, market_code, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                normalized_name,
                normalized_zip,
                match_hash,
                display_name,
                raw_mailing_address,
                market_code,
                fmt_ts(Utc::now()),
            ],
        )
        .context("insert party")?;
        Ok((conn.last_insert_rowid(), true))
    }

    pub async fn get_party(&self, id: i64) -> Result<Option<Party>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {PARTY_COLS} FROM parties WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(party_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Ensure exactly one owner row per party. Attaches the phone when
    /// the existing row has none; recomputes the TCPA flag whenever the
    /// phone changes. Returns (id, created).
    pub async fn ensure_owner(
        &self,
        party_id: i64,
        phone_e164: Option<&str>,
        email: Option<&str>,
        is_tcpa_safe: bool,
    ) -> Result<(i64, bool)> {
        let conn = self.lock().await;
        let existing: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT id, phone_primary FROM owners WHERE party_id = ?1",
                params![party_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match existing {
            Some((id, current_phone)) => {
                if current_phone.is_none() {
                    if let Some(phone) = phone_e164 {
                        conn.execute(
                            "UPDATE owners SET phone_primary = ?2, is_tcpa_safe = ?3, \
                             email = COALESCE(email, ?4) WHERE id = ?1",
                            params![id, phone, is_tcpa_safe as i64, email],
                        )?;
                    }
                }
                Ok((id, false))
            }
            None => {
                conn.execute(
                    "INSERT INTO owners (party_id, phone_primary, email, is_tcpa_safe, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        party_id,
                        phone_e164,
                        email,
                        is_tcpa_safe as i64,
                        fmt_ts(Utc::now()),
                    ],
                )
                .context("insert owner")?;
                Ok((conn.last_insert_rowid(), true))
            }
        }
    }

    pub async fn get_owner(&self, id: i64) -> Result<Option<Owner>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {OWNER_COLS} FROM owners WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(owner_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Monotonically permanent: opt_out is set, never cleared.
    pub async fn mark_owner_opted_out(&self, owner_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE owners SET opt_out = 1, opt_out_at = COALESCE(opt_out_at, ?2) WHERE id = ?1",
            params![owner_id, fmt_ts(at)],
        )?;
        Ok(())
    }

    pub async fn mark_owner_dnr(&self, owner_id: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute("UPDATE owners SET is_dnr = 1 WHERE id = ?1", params![owner_id])?;
        Ok(())
    }

    pub async fn update_owner_phone(
        &self,
        owner_id: i64,
        phone_e164: Option<&str>,
        is_tcpa_safe: bool,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE owners SET phone_primary = ?2, is_tcpa_safe = ?3 WHERE id = ?1",
            params![owner_id, phone_e164, is_tcpa_safe as i64],
        )?;
        Ok(())
    }

    /// Owners whose raw phone has not been normalized/validated yet.
    pub async fn owners_pending_enrichment(
        &self,
        market: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Owner>> {
        let conn = self.lock().await;
        let mut out = Vec::new();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {OWNER_COLS} FROM owners o WHERE o.phone_primary IS NOT NULL \
             AND o.is_tcpa_safe = 0 AND o.opt_out = 0 AND o.is_dnr = 0 \
             AND (?1 IS NULL OR EXISTS (SELECT 1 FROM leads l \
                  WHERE l.owner_id = o.id AND l.market_code = ?1)) \
             ORDER BY o.id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![market, limit.clamp(1, 10_000)], owner_from_row)?;
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Leads
    // ------------------------------------------------------------------

    /// Upsert the (owner, parcel) lead. New leads start at stage NEW
    /// with a zero motivation score. Returns (id, created).
    pub async fn upsert_lead(
        &self,
        owner_id: i64,
        parcel_id: i64,
        market_code: &str,
    ) -> Result<(i64, bool)> {
        let conn = self.lock().await;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM leads WHERE owner_id = ?1 AND parcel_id = ?2",
                params![owner_id, parcel_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        if let Some(id) = existing {
            return Ok((id, false));
        }

        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO leads (owner_id, parcel_id, market_code, motivation_score, \
             pipeline_stage, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 0, 'NEW', 'new', ?4, ?4)",
            params![owner_id, parcel_id, market_code, now],
        )
        .context("insert lead")?;
        Ok((conn.last_insert_rowid(), true))
    }

    pub async fn get_lead(&self, id: i64) -> Result<Option<Lead>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {LEAD_COLS} FROM leads WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(lead_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Assemble the joined read model for one lead.
    pub async fn get_lead_bundle(&self, id: i64) -> Result<Option<LeadBundle>> {
        let Some(lead) = self.get_lead(id).await? else {
            return Ok(None);
        };
        let owner = self
            .get_owner(lead.owner_id)
            .await?
            .context("lead owner missing")?;
        let parcel = self
            .get_parcel(lead.parcel_id)
            .await?
            .context("lead parcel missing")?;
        let party = self
            .get_party(owner.party_id)
            .await?
            .context("owner party missing")?;
        Ok(Some(LeadBundle {
            lead,
            owner,
            parcel,
            party,
        }))
    }

    pub async fn list_leads(&self, filter: &LeadFilter) -> Result<Vec<Lead>> {
        let conn = self.lock().await;
        let stage = filter.stage.map(|s| s.as_str().to_string());
        let market = filter
            .market
            .as_ref()
            .map(|m| m.trim().to_ascii_uppercase());
        let limit = if filter.limit <= 0 { 100 } else { filter.limit.min(1000) };

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {LEAD_COLS} FROM leads l WHERE l.deleted_at IS NULL \
             AND (?1 IS NULL OR l.market_code = ?1) \
             AND (?2 IS NULL OR l.pipeline_stage = ?2) \
             AND (?3 IS NULL OR l.motivation_score >= ?3) \
             AND (?4 = 0 OR EXISTS (SELECT 1 FROM owners o WHERE o.id = l.owner_id \
                  AND o.is_tcpa_safe = 1 AND o.opt_out = 0 AND o.is_dnr = 0)) \
             ORDER BY l.motivation_score DESC, l.id ASC LIMIT ?5 OFFSET ?6"
        ))?;
        let rows = stmt.query_map(
            params![
                market,
                stage,
                filter.min_score,
                filter.tcpa_safe_only as i64,
                limit,
                filter.offset.max(0),
            ],
            lead_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Persist score + details and apply the stage transition in one
    /// statement so score and stage cannot diverge.
    pub async fn apply_score(
        &self,
        lead_id: i64,
        motivation_score: i64,
        score_details: &serde_json::Value,
        new_stage: PipelineStage,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE leads SET motivation_score = ?2, score_details = ?3, \
             pipeline_stage = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                lead_id,
                motivation_score,
                score_details.to_string(),
                new_stage.as_str(),
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Score-only update for manually-advanced leads: the stage column
    /// is left untouched.
    pub async fn apply_score_keep_stage(
        &self,
        lead_id: i64,
        motivation_score: i64,
        score_details: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE leads SET motivation_score = ?2, score_details = ?3, updated_at = ?4 \
             WHERE id = ?1",
            params![
                lead_id,
                motivation_score,
                score_details.to_string(),
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn set_lead_status(&self, lead_id: i64, status: &str) -> Result<bool> {
        let conn = self.lock().await;
        let updated = conn.execute(
            "UPDATE leads SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![lead_id, status, fmt_ts(Utc::now())],
        )?;
        Ok(updated > 0)
    }

    pub async fn set_pipeline_stage(&self, lead_id: i64, stage: PipelineStage) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE leads SET pipeline_stage = ?2, updated_at = ?3 WHERE id = ?1",
            params![lead_id, stage.as_str(), fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Post-send transition: contacted status, stage CONTACTED unless
    /// the lead already sits in a later manually-advanced stage.
    pub async fn mark_lead_contacted(&self, lead_id: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE leads SET status = 'contacted', updated_at = ?2, \
             pipeline_stage = CASE WHEN pipeline_stage IN ('REVIEW', 'OFFER', 'CONTRACT') \
                 THEN pipeline_stage ELSE 'CONTACTED' END \
             WHERE id = ?1",
            params![lead_id, fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Conversation-engine update after an inbound reply.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_reply_update(
        &self,
        lead_id: i64,
        classification: ReplyClassification,
        stage: Option<PipelineStage>,
        last_reply_at: DateTime<Utc>,
        followup_count: i64,
        last_followup_at: DateTime<Utc>,
        next_followup_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE leads SET last_reply_classification = ?2, \
             pipeline_stage = COALESCE(?3, pipeline_stage), last_reply_at = ?4, \
             followup_count = ?5, last_followup_at = ?6, next_followup_at = ?7, \
             updated_at = ?8 WHERE id = ?1",
            params![
                lead_id,
                classification.as_str(),
                stage.map(|s| s.as_str()),
                fmt_ts(last_reply_at),
                followup_count,
                fmt_ts(last_followup_at),
                next_followup_at.map(fmt_ts),
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// State-first followup advance, committed before the gateway call.
    pub async fn advance_followup_state(
        &self,
        lead_id: i64,
        followup_count: i64,
        last_followup_at: DateTime<Utc>,
        next_followup_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE leads SET followup_count = ?2, last_followup_at = ?3, \
             next_followup_at = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                lead_id,
                followup_count,
                fmt_ts(last_followup_at),
                next_followup_at.map(fmt_ts),
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn clear_next_followup(&self, lead_id: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE leads SET next_followup_at = NULL, updated_at = ?2 WHERE id = ?1",
            params![lead_id, fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn schedule_followup(
        &self,
        lead_id: i64,
        next_followup_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE leads SET next_followup_at = ?2, updated_at = ?3 WHERE id = ?1",
            params![lead_id, fmt_ts(next_followup_at), fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Leads whose followup time has elapsed. HOT leads are handed off
    /// to the alert path; NULL classification means no reply yet and is
    /// valid for followup.
    pub async fn followups_due(
        &self,
        now: DateTime<Utc>,
        market: Option<&str>,
        limit: i64,
    ) -> Result<Vec<i64>> {
        let conn = self.lock().await;
        let market = market.map(|m| m.trim().to_ascii_uppercase());
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM leads WHERE deleted_at IS NULL \
             AND next_followup_at IS NOT NULL AND next_followup_at <= ?1 \
             AND pipeline_stage != 'HOT' \
             AND (last_reply_classification IS NULL \
                  OR last_reply_classification NOT IN ('NOT_INTERESTED', 'DEAD')) \
             AND (?2 IS NULL OR market_code = ?2) \
             ORDER BY next_followup_at ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![fmt_ts(now), market, limit.clamp(1, 10_000)],
            |row| row.get::<_, i64>(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Initial-outreach candidates: NEW stage, above the market score
    /// floor, never followed up, nothing sent within the cooldown
    /// window, best first.
    pub async fn initial_outreach_candidates(
        &self,
        market: &str,
        min_score: i64,
        limit: i64,
        cooldown_cutoff: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM leads l WHERE l.deleted_at IS NULL AND l.market_code = ?1 \
             AND l.pipeline_stage = 'NEW' AND l.motivation_score >= ?2 AND l.followup_count = 0 \
             AND NOT EXISTS (SELECT 1 FROM outreach_attempts a \
                 WHERE a.lead_id = l.id AND a.created_at >= ?4) \
             ORDER BY l.motivation_score DESC, l.id ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                market.trim().to_ascii_uppercase(),
                min_score,
                limit.max(0),
                fmt_ts(cooldown_cutoff),
            ],
            |row| row.get::<_, i64>(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn leads_for_scoring(&self, market: &str) -> Result<Vec<i64>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM leads WHERE deleted_at IS NULL AND market_code = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![market.trim().to_ascii_uppercase()], |row| {
            row.get::<_, i64>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Latest lead reachable at the given phone number (inbound SMS
    /// routing).
    pub async fn find_lead_by_owner_phone(&self, phone_e164: &str) -> Result<Option<i64>> {
        let conn = self.lock().await;
        let result: Option<i64> = conn
            .query_row(
                "SELECT l.id FROM leads l JOIN owners o ON o.id = l.owner_id \
                 WHERE o.phone_primary = ?1 AND l.deleted_at IS NULL \
                 ORDER BY l.updated_at DESC LIMIT 1",
                params![phone_e164],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(result)
    }

    /// HOT leads at or above the alert threshold, oldest alert first.
    pub async fn hot_leads_for_alerts(
        &self,
        market: &str,
        threshold: i64,
        limit: i64,
    ) -> Result<Vec<i64>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM leads WHERE deleted_at IS NULL AND market_code = ?1 \
             AND pipeline_stage = 'HOT' AND motivation_score >= ?2 \
             ORDER BY COALESCE(last_alerted_at, '') ASC, motivation_score DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![market.trim().to_ascii_uppercase(), threshold, limit.clamp(1, 1000)],
            |row| row.get::<_, i64>(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn mark_lead_alerted(&self, lead_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE leads SET last_alerted_at = ?2, updated_at = ?3 WHERE id = ?1",
            params![lead_id, fmt_ts(at), fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-lead send lock
    // ------------------------------------------------------------------

    /// Compare-and-set acquire: succeeds when no lock exists, the lock
    /// has expired, or this instance already holds it.
    pub async fn try_acquire_send_lock(
        &self,
        lead_id: i64,
        instance_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let expired_cutoff = fmt_ts(now - ttl);
        let updated = conn.execute(
            "UPDATE leads SET send_locked_at = ?2, send_locked_by = ?3 \
             WHERE id = ?1 AND (send_locked_at IS NULL OR send_locked_at <= ?4 \
                   OR send_locked_by = ?3)",
            params![lead_id, fmt_ts(now), instance_id, expired_cutoff],
        )?;
        Ok(updated > 0)
    }

    /// Clears the lock only while this instance still holds it.
    pub async fn release_send_lock(&self, lead_id: i64, instance_id: &str) -> Result<bool> {
        let conn = self.lock().await;
        let updated = conn.execute(
            "UPDATE leads SET send_locked_at = NULL, send_locked_by = NULL \
             WHERE id = ?1 AND send_locked_by = ?2",
            params![lead_id, instance_id],
        )?;
        Ok(updated > 0)
    }
}
