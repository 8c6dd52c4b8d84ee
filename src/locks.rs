//! Distributed locking: per-lead send locks and named scheduler locks.
//!
//! Both are backed by store rows so they hold across processes, not
//! just across workers in this one. Lock identity is the instance id
//! generated at service construction.

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::Store;

/// Per-lead advisory lock with TTL. Grants exclusive send rights on a
/// lead to one holder at a time.
#[derive(Clone)]
pub struct SendLockService {
    store: Store,
    instance_id: String,
    ttl: Duration,
}

pub const DEFAULT_SEND_LOCK_TTL_SECS: i64 = 60;

impl SendLockService {
    pub fn new(store: Store) -> Self {
        Self::with_ttl(store, Duration::seconds(DEFAULT_SEND_LOCK_TTL_SECS))
    }

    pub fn with_ttl(store: Store, ttl: Duration) -> Self {
        Self {
            store,
            instance_id: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Succeeds when no lock exists, the lock expired, or we already
    /// hold it (re-entrant).
    pub async fn acquire(&self, lead_id: i64) -> Result<bool> {
        let acquired = self
            .store
            .try_acquire_send_lock(lead_id, &self.instance_id, Utc::now(), self.ttl)
            .await?;
        if acquired {
            debug!(lead_id, "send lock acquired");
        } else {
            debug!(lead_id, "send lock held elsewhere");
        }
        Ok(acquired)
    }

    /// Clears the lock only while we still hold it.
    pub async fn release(&self, lead_id: i64) -> Result<()> {
        if !self.store.release_send_lock(lead_id, &self.instance_id).await? {
            debug!(lead_id, "send lock already taken over, release skipped");
        }
        Ok(())
    }

    /// acquire -> work -> release, with release on every exit path.
    pub async fn with_lock<T, F, Fut>(&self, lead_id: i64, work: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.acquire(lead_id).await? {
            return Ok(None);
        }
        let outcome = work().await;
        if let Err(e) = self.release(lead_id).await {
            warn!(lead_id, error = %e, "send lock release failed");
        }
        outcome.map(Some)
    }
}

/// Cluster-wide named lock serializing the nightly pipeline.
#[derive(Clone)]
pub struct SchedulerLockService {
    store: Store,
    instance_id: String,
}

impl SchedulerLockService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Insert, steal-if-expired, or extend-if-held. Re-entrant for the
    /// same holder (the expiry is pushed out).
    pub async fn acquire(&self, lock_name: &str, ttl: Duration) -> Result<bool> {
        let acquired = self
            .store
            .try_acquire_scheduler_lock(lock_name, &self.instance_id, Utc::now(), ttl)
            .await?;
        if acquired {
            debug!(lock = lock_name, "scheduler lock acquired");
        } else {
            warn!(lock = lock_name, "scheduler lock held by another instance");
        }
        Ok(acquired)
    }

    pub async fn release(&self, lock_name: &str) -> Result<()> {
        self.store
            .release_scheduler_lock(lock_name, &self.instance_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::store::IngestParcel;

    async fn seed_lead(store: &Store) -> i64 {
        let (parcel_id, _) = store
            .upsert_parcel(&IngestParcel {
                canonical_parcel_id: "L1".into(),
                parish: "East Baton Rouge".into(),
                market_code: "LA".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let (party_id, _) = store
            .upsert_party("h1", "JOHN DOE", "70801", "John Doe", None, "LA")
            .await
            .unwrap();
        let (owner_id, _) = store.ensure_owner(party_id, None, None, false).await.unwrap();
        store.upsert_lead(owner_id, parcel_id, "LA").await.unwrap().0
    }

    #[tokio::test]
    async fn send_lock_scoped_work_releases() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store).await;
        let locks = SendLockService::new(store.clone());
        let other = SendLockService::new(store.clone());

        let result = locks
            .with_lock(lead_id, || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(result, Some(42));

        // Released on exit: another instance can acquire.
        assert!(other.acquire(lead_id).await.unwrap());
    }

    #[tokio::test]
    async fn send_lock_released_on_error_path() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store).await;
        let locks = SendLockService::new(store.clone());
        let other = SendLockService::new(store.clone());

        let result: Result<Option<()>> = locks
            .with_lock(lead_id, || async { anyhow::bail!("gateway exploded") })
            .await;
        assert!(result.is_err());

        // Lock must not leak after the failure.
        assert!(other.acquire(lead_id).await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_reports_contention() {
        let (store, _file) = temp_store();
        let lead_id = seed_lead(&store).await;
        let holder = SendLockService::new(store.clone());
        let contender = SendLockService::new(store.clone());

        assert!(holder.acquire(lead_id).await.unwrap());
        let result = contender
            .with_lock(lead_id, || async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn scheduler_lock_round_trip() {
        let (store, _file) = temp_store();
        let a = SchedulerLockService::new(store.clone());
        let b = SchedulerLockService::new(store.clone());
        let ttl = Duration::hours(1);

        assert!(a.acquire("nightly_pipeline", ttl).await.unwrap());
        assert!(!b.acquire("nightly_pipeline", ttl).await.unwrap());
        a.release("nightly_pipeline").await.unwrap();
        assert!(b.acquire("nightly_pipeline", ttl).await.unwrap());
    }
}
