//! Transactional relational store. Single source of truth.
//!
//! SQLite behind a shared connection; WAL journal mode so readers and
//! the writer do not block each other. All timestamps are RFC3339 UTC
//! text with fixed-width fractional seconds, which keeps lexicographic
//! ordering equal to chronological ordering in SQL comparisons.

mod buyers;
mod leads;
mod outreach;
mod tasks;

pub use buyers::NewBuyer;
pub use leads::{IngestParcel, LeadFilter};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Format a timestamp for storage/comparison.
pub fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp; naive inputs are treated as UTC.
pub fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}

pub(crate) fn opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}

pub(crate) fn opt_json(s: Option<String>) -> Option<serde_json::Value> {
    s.as_deref().and_then(|v| serde_json::from_str(v).ok())
}

impl Store {
    /// Open (or create) the database and apply the schema.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open database at {db_path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS parties (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                normalized_name TEXT NOT NULL,
                normalized_zip TEXT NOT NULL,
                match_hash TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                raw_mailing_address TEXT,
                market_code TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS owners (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                party_id INTEGER NOT NULL REFERENCES parties(id),
                phone_primary TEXT,
                email TEXT,
                is_tcpa_safe INTEGER NOT NULL DEFAULT 0,
                is_dnr INTEGER NOT NULL DEFAULT 0,
                opt_out INTEGER NOT NULL DEFAULT 0,
                opt_out_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_owners_party ON owners(party_id);
            CREATE INDEX IF NOT EXISTS idx_owners_phone ON owners(phone_primary);

            CREATE TABLE IF NOT EXISTS parcels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canonical_parcel_id TEXT NOT NULL UNIQUE,
                parish TEXT NOT NULL,
                market_code TEXT NOT NULL,
                situs_address TEXT,
                city TEXT,
                state TEXT,
                postal_code TEXT,
                latitude REAL,
                longitude REAL,
                zoning TEXT,
                geometry TEXT,
                land_assessed_value REAL,
                improvement_assessed_value REAL,
                lot_size_acres REAL,
                is_adjudicated INTEGER NOT NULL DEFAULT 0,
                years_tax_delinquent INTEGER NOT NULL DEFAULT 0,
                raw_data TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS leads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL REFERENCES owners(id),
                parcel_id INTEGER NOT NULL REFERENCES parcels(id),
                market_code TEXT NOT NULL,
                motivation_score INTEGER NOT NULL DEFAULT 0,
                score_details TEXT,
                pipeline_stage TEXT NOT NULL DEFAULT 'NEW',
                status TEXT NOT NULL DEFAULT 'new',
                last_reply_classification TEXT,
                last_reply_at TEXT,
                followup_count INTEGER NOT NULL DEFAULT 0,
                last_followup_at TEXT,
                next_followup_at TEXT,
                last_alerted_at TEXT,
                send_locked_at TEXT,
                send_locked_by TEXT,
                tags TEXT,
                deleted_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(owner_id, parcel_id)
            );
            CREATE INDEX IF NOT EXISTS idx_leads_market_stage
                ON leads(market_code, pipeline_stage);
            CREATE INDEX IF NOT EXISTS idx_leads_next_followup
                ON leads(next_followup_at);

            CREATE TABLE IF NOT EXISTS outreach_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                idempotency_key TEXT UNIQUE,
                channel TEXT NOT NULL DEFAULT 'sms',
                message_body TEXT,
                message_context TEXT NOT NULL DEFAULT 'intro',
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                external_id TEXT,
                sent_at TEXT,
                delivered_at TEXT,
                response_received_at TEXT,
                response_body TEXT,
                reply_classification TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_lead_created
                ON outreach_attempts(lead_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_attempts_external
                ON outreach_attempts(external_id);

            CREATE TABLE IF NOT EXISTS inbound_messages (
                message_sid TEXT PRIMARY KEY,
                from_number TEXT NOT NULL,
                body TEXT NOT NULL,
                received_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS timeline_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                event_type TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_timeline_lead
                ON timeline_events(lead_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS alert_configs (
                market_code TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 1,
                hot_score_threshold INTEGER NOT NULL DEFAULT 65,
                sms_numbers TEXT NOT NULL DEFAULT '[]',
                slack_webhook_url TEXT,
                dedup_hours INTEGER NOT NULL DEFAULT 24
            );

            CREATE TABLE IF NOT EXISTS background_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL UNIQUE,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                market_code TEXT,
                params TEXT,
                result TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS scheduler_locks (
                lock_name TEXT PRIMARY KEY,
                locked_by TEXT NOT NULL,
                locked_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS buyers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                phone TEXT,
                email TEXT,
                market_codes TEXT NOT NULL DEFAULT '[]',
                counties TEXT NOT NULL DEFAULT '[]',
                min_acres REAL,
                max_acres REAL,
                price_min REAL,
                price_max REAL,
                target_spread REAL,
                vip INTEGER NOT NULL DEFAULT 0,
                pof_verified INTEGER NOT NULL DEFAULT 0,
                deals_count INTEGER NOT NULL DEFAULT 0,
                last_deal_sent_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS buyer_deals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                buyer_id INTEGER NOT NULL REFERENCES buyers(id),
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                stage TEXT NOT NULL DEFAULT 'NEW',
                match_score REAL NOT NULL DEFAULT 0,
                blast_sent_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(buyer_id, lead_id)
            );

            CREATE TABLE IF NOT EXISTS deal_sheets (
                lead_id INTEGER PRIMARY KEY REFERENCES leads(id),
                content TEXT NOT NULL,
                ai_description TEXT,
                generated_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );",
        )
        .context("apply schema")?;

        Ok(())
    }

    /// Row counts per entity, used by ingestion reporting and tests.
    pub async fn entity_counts(&self) -> Result<EntityCounts> {
        let conn = self.lock().await;
        let count = |table: &str| -> Result<i64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .map_err(Into::into)
        };
        Ok(EntityCounts {
            parties: count("parties")?,
            owners: count("owners")?,
            parcels: count("parcels")?,
            leads: count("leads")?,
            outreach_attempts: count("outreach_attempts")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityCounts {
    pub parties: i64,
    pub owners: i64,
    pub parcels: i64,
    pub leads: i64,
    pub outreach_attempts: i64,
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Store;
    use tempfile::NamedTempFile;

    /// Throwaway store backed by a temp file; the file guard must be
    /// kept alive for the store's lifetime.
    pub fn temp_store() -> (Store, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).unwrap();
        (store, file)
    }
}
