//! Outreach attempt persistence: idempotency slots, finalization,
//! delivery status, inbound replies.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, Row};

use super::{fmt_ts, opt_ts, Store};
use crate::models::{AttemptStatus, MessageContext, OutreachAttempt, ReplyClassification};

const ATTEMPT_COLS: &str = "id, lead_id, idempotency_key, channel, message_body, message_context, \
     status, result, external_id, sent_at, delivered_at, response_received_at, response_body, \
     reply_classification, error_message, created_at";

pub(crate) fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<OutreachAttempt> {
    let context: String = row.get(5)?;
    let status: String = row.get(6)?;
    let classification: Option<String> = row.get(13)?;
    Ok(OutreachAttempt {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        idempotency_key: row.get(2)?,
        channel: row.get(3)?,
        message_body: row.get(4)?,
        message_context: MessageContext::parse(&context).unwrap_or(MessageContext::Intro),
        status: AttemptStatus::parse(&status).unwrap_or(AttemptStatus::Pending),
        result: row.get(7)?,
        external_id: row.get(8)?,
        sent_at: opt_ts(row.get(9)?),
        delivered_at: opt_ts(row.get(10)?),
        response_received_at: opt_ts(row.get(11)?),
        response_body: row.get(12)?,
        reply_classification: classification
            .as_deref()
            .and_then(ReplyClassification::parse),
        error_message: row.get(14)?,
        created_at: super::parse_ts(&row.get::<_, String>(15)?),
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl Store {
    /// Reserve an idempotency slot: insert a pending row carrying the
    /// key. Returns None when the key already exists (another caller
    /// won the race or the send already happened).
    pub async fn reserve_attempt(
        &self,
        lead_id: i64,
        idempotency_key: &str,
        channel: &str,
        context: MessageContext,
    ) -> Result<Option<OutreachAttempt>> {
        {
            let conn = self.lock().await;
            let inserted = conn.execute(
                "INSERT INTO outreach_attempts \
                 (lead_id, idempotency_key, channel, message_context, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                params![
                    lead_id,
                    idempotency_key,
                    channel,
                    context.as_str(),
                    fmt_ts(Utc::now()),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Ok(None),
                Err(e) => return Err(e).context("reserve outreach attempt"),
            }
        }
        self.get_attempt_by_key(idempotency_key).await
    }

    pub async fn get_attempt_by_key(&self, key: &str) -> Result<Option<OutreachAttempt>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ATTEMPT_COLS} FROM outreach_attempts WHERE idempotency_key = ?1"
        ))?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(attempt_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_attempt(&self, id: i64) -> Result<Option<OutreachAttempt>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ATTEMPT_COLS} FROM outreach_attempts WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(attempt_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Second transaction of reserve-then-execute: record what the
    /// gateway said.
    pub async fn finalize_attempt(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        result: &str,
        message_body: Option<&str>,
        external_id: Option<&str>,
        error_message: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE outreach_attempts SET status = ?2, result = ?3, \
             message_body = COALESCE(?4, message_body), external_id = ?5, \
             error_message = ?6, sent_at = ?7 WHERE id = ?1",
            params![
                attempt_id,
                status.as_str(),
                result,
                message_body,
                external_id,
                error_message,
                sent_at.map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    /// Most recent outbound attempt for a lead, replies attach here.
    pub async fn latest_attempt_for_lead(&self, lead_id: i64) -> Result<Option<OutreachAttempt>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ATTEMPT_COLS} FROM outreach_attempts WHERE lead_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![lead_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(attempt_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn record_attempt_response(
        &self,
        attempt_id: i64,
        body: &str,
        received_at: DateTime<Utc>,
        classification: ReplyClassification,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE outreach_attempts SET response_body = ?2, response_received_at = ?3, \
             reply_classification = ?4 WHERE id = ?1",
            params![
                attempt_id,
                body,
                fmt_ts(received_at),
                classification.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Delivery-status webhook: update by gateway message id.
    pub async fn update_delivery_status(
        &self,
        external_id: &str,
        status: AttemptStatus,
        delivered_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let updated = conn.execute(
            "UPDATE outreach_attempts SET status = ?2, \
             delivered_at = COALESCE(?3, delivered_at) WHERE external_id = ?1",
            params![external_id, status.as_str(), delivered_at.map(fmt_ts)],
        )?;
        Ok(updated > 0)
    }

    /// Sent + dry-run attempts since a cutoff (daily cap accounting).
    pub async fn count_sends_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let conn = self.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outreach_attempts \
             WHERE created_at >= ?1 AND status IN ('sent', 'dry_run')",
            params![fmt_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn list_attempts(
        &self,
        lead_id: Option<i64>,
        status: Option<AttemptStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OutreachAttempt>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ATTEMPT_COLS} FROM outreach_attempts \
             WHERE (?1 IS NULL OR lead_id = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY created_at DESC, id DESC LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![
                lead_id,
                status.map(|s| s.as_str()),
                limit.clamp(1, 1000),
                offset.max(0),
            ],
            attempt_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Record an inbound webhook message. Returns false when the
    /// MessageSid was already seen (webhook replay).
    pub async fn record_inbound_message(
        &self,
        message_sid: &str,
        from_number: &str,
        body: &str,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let inserted = conn.execute(
            "INSERT INTO inbound_messages (message_sid, from_number, body, received_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![message_sid, from_number, body, fmt_ts(Utc::now())],
        );
        match inserted {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e).context("record inbound message"),
        }
    }
}
