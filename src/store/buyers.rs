//! Buyer roster, buyer-deal tracking and the deal sheet cache.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::{fmt_ts, opt_ts, Store};
use crate::models::{Buyer, BuyerDeal, BuyerDealStage};

const BUYER_COLS: &str = "id, name, phone, email, market_codes, counties, min_acres, max_acres, \
     price_min, price_max, target_spread, vip, pof_verified, deals_count, last_deal_sent_at";

fn buyer_from_row(row: &Row<'_>) -> rusqlite::Result<Buyer> {
    let markets: String = row.get(4)?;
    let counties: String = row.get(5)?;
    Ok(Buyer {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        market_codes: serde_json::from_str(&markets).unwrap_or_default(),
        counties: serde_json::from_str(&counties).unwrap_or_default(),
        min_acres: row.get(6)?,
        max_acres: row.get(7)?,
        price_min: row.get(8)?,
        price_max: row.get(9)?,
        target_spread: row.get(10)?,
        vip: row.get::<_, i64>(11)? != 0,
        pof_verified: row.get::<_, i64>(12)? != 0,
        deals_count: row.get(13)?,
        last_deal_sent_at: opt_ts(row.get(14)?),
    })
}

fn deal_from_row(row: &Row<'_>) -> rusqlite::Result<BuyerDeal> {
    let stage: String = row.get(3)?;
    Ok(BuyerDeal {
        id: row.get(0)?,
        buyer_id: row.get(1)?,
        lead_id: row.get(2)?,
        stage: BuyerDealStage::parse(&stage).unwrap_or(BuyerDealStage::New),
        match_score: row.get(4)?,
        blast_sent_at: opt_ts(row.get(5)?),
        created_at: super::parse_ts(&row.get::<_, String>(6)?),
    })
}

/// Buyer creation payload (store assigns the id).
#[derive(Debug, Clone, Default)]
pub struct NewBuyer {
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
}

impl Store {
    pub async fn insert_buyer(&self, buyer: &NewBuyer) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO buyers (name, phone, email, market_codes, counties, min_acres, \
             max_acres, price_min, price_max, target_spread, vip, pof_verified, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                buyer.name,
                buyer.phone,
                buyer.email,
                serde_json::to_string(&buyer.market_codes)?,
                serde_json::to_string(&buyer.counties)?,
                buyer.min_acres,
                buyer.max_acres,
                buyer.price_min,
                buyer.price_max,
                buyer.target_spread,
                buyer.vip as i64,
                buyer.pof_verified as i64,
                fmt_ts(Utc::now()),
            ],
        )
        .context("insert buyer")?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_buyer(&self, id: i64) -> Result<Option<Buyer>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {BUYER_COLS} FROM buyers WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(buyer_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_buyers(&self) -> Result<Vec<Buyer>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {BUYER_COLS} FROM buyers ORDER BY id ASC"))?;
        let rows = stmt.query_map([], buyer_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_buyers_by_ids(&self, ids: &[i64]) -> Result<Vec<Buyer>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(buyer) = self.get_buyer(*id).await? {
                out.push(buyer);
            }
        }
        Ok(out)
    }

    /// Bump blast stats after a successful deal send.
    pub async fn record_buyer_deal_sent(&self, buyer_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE buyers SET deals_count = deals_count + 1, last_deal_sent_at = ?2 \
             WHERE id = ?1",
            params![buyer_id, fmt_ts(at)],
        )?;
        Ok(())
    }

    pub async fn get_buyer_deal(&self, buyer_id: i64, lead_id: i64) -> Result<Option<BuyerDeal>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, buyer_id, lead_id, stage, match_score, blast_sent_at, created_at \
             FROM buyer_deals WHERE buyer_id = ?1 AND lead_id = ?2",
        )?;
        let mut rows = stmt.query(params![buyer_id, lead_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(deal_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn upsert_buyer_deal(
        &self,
        buyer_id: i64,
        lead_id: i64,
        stage: BuyerDealStage,
        match_score: f64,
    ) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO buyer_deals (buyer_id, lead_id, stage, match_score, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(buyer_id, lead_id) DO UPDATE SET \
                stage = excluded.stage, match_score = excluded.match_score",
            params![
                buyer_id,
                lead_id,
                stage.as_str(),
                match_score,
                fmt_ts(Utc::now()),
            ],
        )
        .context("upsert buyer deal")?;
        let id: i64 = conn.query_row(
            "SELECT id FROM buyer_deals WHERE buyer_id = ?1 AND lead_id = ?2",
            params![buyer_id, lead_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub async fn mark_deal_blasted(&self, deal_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE buyer_deals SET stage = 'DEAL_SENT', blast_sent_at = ?2 WHERE id = ?1",
            params![deal_id, fmt_ts(at)],
        )?;
        Ok(())
    }

    /// Assessed-value comps summary for a parish: count and average
    /// land value per acre over parcels with both figures on record.
    pub async fn parish_price_per_acre(&self, parish: &str) -> Result<(i64, Option<f64>)> {
        let conn = self.lock().await;
        let (count, avg): (i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), AVG(land_assessed_value / lot_size_acres) FROM parcels \
             WHERE parish = ?1 COLLATE NOCASE AND land_assessed_value > 0 \
             AND lot_size_acres > 0",
            params![parish],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count, avg))
    }

    // ------------------------------------------------------------------
    // Deal sheet cache
    // ------------------------------------------------------------------

    pub async fn get_cached_deal_sheet(
        &self,
        lead_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<(serde_json::Value, Option<String>)>> {
        let conn = self.lock().await;
        let result: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT content, ai_description, expires_at FROM deal_sheets WHERE lead_id = ?1",
                params![lead_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match result {
            Some((content, ai_description, expires_at)) => {
                if super::parse_ts(&expires_at) <= now {
                    return Ok(None);
                }
                let value = serde_json::from_str(&content).unwrap_or(serde_json::Value::Null);
                Ok(Some((value, ai_description)))
            }
            None => Ok(None),
        }
    }

    pub async fn put_deal_sheet(
        &self,
        lead_id: i64,
        content: &serde_json::Value,
        ai_description: Option<&str>,
        generated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO deal_sheets (lead_id, content, ai_description, generated_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(lead_id) DO UPDATE SET \
                content = excluded.content, \
                ai_description = excluded.ai_description, \
                generated_at = excluded.generated_at, \
                expires_at = excluded.expires_at",
            params![
                lead_id,
                content.to_string(),
                ai_description,
                fmt_ts(generated_at),
                fmt_ts(expires_at),
            ],
        )
        .context("cache deal sheet")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use chrono::Duration;

    #[tokio::test]
    async fn buyer_roundtrip() {
        let (store, _file) = temp_store();
        let id = store
            .insert_buyer(&NewBuyer {
                name: "Acme Land Fund".into(),
                phone: Some("+15125550100".into()),
                market_codes: vec!["LA".into()],
                counties: vec!["East Baton Rouge".into()],
                min_acres: Some(1.0),
                max_acres: Some(5.0),
                price_min: Some(10_000.0),
                price_max: Some(30_000.0),
                vip: true,
                pof_verified: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let buyer = store.get_buyer(id).await.unwrap().unwrap();
        assert_eq!(buyer.market_codes, vec!["LA".to_string()]);
        assert!(buyer.vip);
        assert_eq!(buyer.deals_count, 0);

        store.record_buyer_deal_sent(id, Utc::now()).await.unwrap();
        let buyer = store.get_buyer(id).await.unwrap().unwrap();
        assert_eq!(buyer.deals_count, 1);
        assert!(buyer.last_deal_sent_at.is_some());
    }

    #[tokio::test]
    async fn deal_sheet_cache_expires() {
        let (store, _file) = temp_store();
        let now = Utc::now();
        let content = serde_json::json!({"low_offer": 22_000});

        store
            .put_deal_sheet(1, &content, None, now, now + Duration::hours(24))
            .await
            .unwrap();

        let hit = store.get_cached_deal_sheet(1, now).await.unwrap();
        assert!(hit.is_some());

        let miss = store
            .get_cached_deal_sheet(1, now + Duration::hours(25))
            .await
            .unwrap();
        assert!(miss.is_none());
    }
}
