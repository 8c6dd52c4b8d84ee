//! Background task records, scheduler locks, timeline events and
//! alert configuration.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};

use super::{fmt_ts, opt_json, opt_ts, Store};
use crate::models::{AlertConfig, BackgroundTask, SchedulerLock, TaskStatus, TimelineEvent};

const TASK_COLS: &str = "id, task_id, task_type, status, market_code, params, result, \
     error_message, created_at, started_at, completed_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<BackgroundTask> {
    let status: String = row.get(3)?;
    Ok(BackgroundTask {
        id: row.get(0)?,
        task_id: row.get(1)?,
        task_type: row.get(2)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        market_code: row.get(4)?,
        params: opt_json(row.get(5)?),
        result: opt_json(row.get(6)?),
        error_message: row.get(7)?,
        created_at: super::parse_ts(&row.get::<_, String>(8)?),
        started_at: opt_ts(row.get(9)?),
        completed_at: opt_ts(row.get(10)?),
    })
}

fn timeline_from_row(row: &Row<'_>) -> rusqlite::Result<TimelineEvent> {
    Ok(TimelineEvent {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        event_type: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        metadata: opt_json(row.get(5)?),
        created_at: super::parse_ts(&row.get::<_, String>(6)?),
    })
}

impl Store {
    // ------------------------------------------------------------------
    // Timeline
    // ------------------------------------------------------------------

    pub async fn append_timeline_event(
        &self,
        lead_id: i64,
        event_type: &str,
        title: &str,
        description: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO timeline_events (lead_id, event_type, title, description, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                lead_id,
                event_type,
                title,
                description,
                metadata.map(|m| m.to_string()),
                fmt_ts(Utc::now()),
            ],
        )
        .context("append timeline event")?;
        Ok(())
    }

    pub async fn list_timeline(&self, lead_id: i64, limit: i64) -> Result<Vec<TimelineEvent>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, lead_id, event_type, title, description, metadata, created_at \
             FROM timeline_events WHERE lead_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![lead_id, limit.clamp(1, 500)], timeline_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    pub async fn create_task(
        &self,
        task_id: &str,
        task_type: &str,
        market_code: Option<&str>,
        task_params: Option<&serde_json::Value>,
    ) -> Result<BackgroundTask> {
        {
            let conn = self.lock().await;
            conn.execute(
                "INSERT INTO background_tasks (task_id, task_type, status, market_code, params, created_at) \
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
                params![
                    task_id,
                    task_type,
                    market_code,
                    task_params.map(|p| p.to_string()),
                    fmt_ts(Utc::now()),
                ],
            )
            .context("create background task")?;
        }
        self.get_task(task_id)
            .await?
            .context("task vanished after insert")
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<BackgroundTask>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TASK_COLS} FROM background_tasks WHERE task_id = ?1"
        ))?;
        let mut rows = stmt.query(params![task_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(task_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_tasks(
        &self,
        task_type: Option<&str>,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<BackgroundTask>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TASK_COLS} FROM background_tasks \
             WHERE (?1 IS NULL OR task_type = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY created_at DESC, id DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![task_type, status.map(|s| s.as_str()), limit.clamp(1, 500)],
            task_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn mark_task_running(&self, task_id: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE background_tasks SET status = 'running', started_at = ?2 WHERE task_id = ?1",
            params![task_id, fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn mark_task_completed(
        &self,
        task_id: &str,
        result: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE background_tasks SET status = 'completed', result = ?2, completed_at = ?3 \
             WHERE task_id = ?1",
            params![task_id, result.to_string(), fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn mark_task_failed(
        &self,
        task_id: &str,
        error_message: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE background_tasks SET status = 'failed', error_message = ?2, result = ?3, \
             completed_at = ?4 WHERE task_id = ?1",
            params![
                task_id,
                error_message,
                result.map(|r| r.to_string()),
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn mark_task_cancelled(
        &self,
        task_id: &str,
        reason: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE background_tasks SET status = 'cancelled', error_message = ?2, result = ?3, \
             completed_at = ?4 WHERE task_id = ?1",
            params![
                task_id,
                reason,
                result.map(|r| r.to_string()),
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduler locks
    // ------------------------------------------------------------------

    /// Single-statement acquire: insert, or take over when the row is
    /// expired or already ours (re-entrant extension). The caller owns
    /// the lock iff the stored holder equals `instance_id` afterwards.
    pub async fn try_acquire_scheduler_lock(
        &self,
        lock_name: &str,
        instance_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let expires = fmt_ts(now + ttl);
        conn.execute(
            "INSERT INTO scheduler_locks (lock_name, locked_by, locked_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(lock_name) DO UPDATE SET \
                locked_by = excluded.locked_by, \
                locked_at = excluded.locked_at, \
                expires_at = excluded.expires_at \
             WHERE scheduler_locks.expires_at <= ?3 OR scheduler_locks.locked_by = ?2",
            params![lock_name, instance_id, fmt_ts(now), expires],
        )
        .context("acquire scheduler lock")?;

        let holder: Option<String> = conn
            .query_row(
                "SELECT locked_by FROM scheduler_locks WHERE lock_name = ?1",
                params![lock_name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(holder.as_deref() == Some(instance_id))
    }

    pub async fn release_scheduler_lock(&self, lock_name: &str, instance_id: &str) -> Result<bool> {
        let conn = self.lock().await;
        let deleted = conn.execute(
            "DELETE FROM scheduler_locks WHERE lock_name = ?1 AND locked_by = ?2",
            params![lock_name, instance_id],
        )?;
        Ok(deleted > 0)
    }

    pub async fn get_scheduler_lock(&self, lock_name: &str) -> Result<Option<SchedulerLock>> {
        let conn = self.lock().await;
        let result = conn
            .query_row(
                "SELECT lock_name, locked_by, locked_at, expires_at FROM scheduler_locks \
                 WHERE lock_name = ?1",
                params![lock_name],
                |row| {
                    Ok(SchedulerLock {
                        lock_name: row.get(0)?,
                        locked_by: row.get(1)?,
                        locked_at: super::parse_ts(&row.get::<_, String>(2)?),
                        expires_at: super::parse_ts(&row.get::<_, String>(3)?),
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(result)
    }

    pub async fn cleanup_expired_scheduler_locks(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock().await;
        let deleted = conn.execute(
            "DELETE FROM scheduler_locks WHERE expires_at < ?1",
            params![fmt_ts(now)],
        )?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Alert configuration
    // ------------------------------------------------------------------

    pub async fn get_alert_config(&self, market_code: &str) -> Result<Option<AlertConfig>> {
        let conn = self.lock().await;
        let result = conn
            .query_row(
                "SELECT market_code, enabled, hot_score_threshold, sms_numbers, \
                 slack_webhook_url, dedup_hours FROM alert_configs WHERE market_code = ?1",
                params![market_code.trim().to_ascii_uppercase()],
                |row| {
                    let numbers: String = row.get(3)?;
                    Ok(AlertConfig {
                        market_code: row.get(0)?,
                        enabled: row.get::<_, i64>(1)? != 0,
                        hot_score_threshold: row.get(2)?,
                        sms_numbers: serde_json::from_str(&numbers).unwrap_or_default(),
                        slack_webhook_url: row.get(4)?,
                        dedup_hours: row.get(5)?,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(result)
    }

    pub async fn upsert_alert_config(&self, config: &AlertConfig) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO alert_configs \
             (market_code, enabled, hot_score_threshold, sms_numbers, slack_webhook_url, dedup_hours) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(market_code) DO UPDATE SET \
                enabled = excluded.enabled, \
                hot_score_threshold = excluded.hot_score_threshold, \
                sms_numbers = excluded.sms_numbers, \
                slack_webhook_url = excluded.slack_webhook_url, \
                dedup_hours = excluded.dedup_hours",
            params![
                config.market_code.trim().to_ascii_uppercase(),
                config.enabled as i64,
                config.hot_score_threshold,
                serde_json::to_string(&config.sms_numbers)?,
                config.slack_webhook_url,
                config.dedup_hours,
            ],
        )
        .context("upsert alert config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;

    #[tokio::test]
    async fn scheduler_lock_exclusivity() {
        let (store, _file) = temp_store();
        let now = Utc::now();
        let ttl = Duration::hours(1);

        assert!(store
            .try_acquire_scheduler_lock("nightly_pipeline", "inst-a", now, ttl)
            .await
            .unwrap());
        assert!(!store
            .try_acquire_scheduler_lock("nightly_pipeline", "inst-b", now, ttl)
            .await
            .unwrap());
        // Re-entrant extension for the holder.
        assert!(store
            .try_acquire_scheduler_lock("nightly_pipeline", "inst-a", now, ttl)
            .await
            .unwrap());

        // Only the holder may release.
        assert!(!store
            .release_scheduler_lock("nightly_pipeline", "inst-b")
            .await
            .unwrap());
        assert!(store
            .release_scheduler_lock("nightly_pipeline", "inst-a")
            .await
            .unwrap());

        assert!(store
            .try_acquire_scheduler_lock("nightly_pipeline", "inst-b", now, ttl)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_scheduler_lock_is_stolen() {
        let (store, _file) = temp_store();
        let now = Utc::now();

        assert!(store
            .try_acquire_scheduler_lock("job", "inst-a", now, Duration::seconds(1))
            .await
            .unwrap());
        let later = now + Duration::seconds(5);
        assert!(store
            .try_acquire_scheduler_lock("job", "inst-b", later, Duration::hours(1))
            .await
            .unwrap());

        let lock = store.get_scheduler_lock("job").await.unwrap().unwrap();
        assert_eq!(lock.locked_by, "inst-b");
    }

    #[tokio::test]
    async fn task_lifecycle() {
        let (store, _file) = temp_store();
        let task = store
            .create_task("t-1", "nightly_pipeline", Some("LA"), None)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        store.mark_task_running("t-1").await.unwrap();
        let task = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        store
            .mark_task_completed("t-1", &serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let task = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn alert_config_roundtrip() {
        let (store, _file) = temp_store();
        assert!(store.get_alert_config("LA").await.unwrap().is_none());

        let config = AlertConfig {
            market_code: "LA".into(),
            enabled: true,
            hot_score_threshold: 70,
            sms_numbers: vec!["+12255550100".into()],
            slack_webhook_url: Some("https://hooks.slack.example/abc".into()),
            dedup_hours: 24,
        };
        store.upsert_alert_config(&config).await.unwrap();

        let loaded = store.get_alert_config("la").await.unwrap().unwrap();
        assert_eq!(loaded.hot_score_threshold, 70);
        assert_eq!(loaded.sms_numbers, vec!["+12255550100".to_string()]);
    }
}
