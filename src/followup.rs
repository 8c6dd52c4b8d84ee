//! Followup scheduler: state-first dispatch of due followups.
//!
//! Counters and next_followup_at advance BEFORE the gateway call, so a
//! crash mid-send can only lose a message, never double-send it; the
//! idempotency slot catches same-day retries on top of that.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::markets::{self, market_config};
use crate::models::{AttemptStatus, MessageContext};
use crate::outreach::{validate_can_send, DispatchOutcome, OutreachDispatcher};
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FollowupRunStats {
    pub due: usize,
    pub sent: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct FollowupScheduler {
    store: Store,
    dispatcher: Arc<OutreachDispatcher>,
}

impl FollowupScheduler {
    pub fn new(store: Store, dispatcher: Arc<OutreachDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Process all due followups (optionally one market), oldest due
    /// first. Per-lead failures are absorbed into the stats.
    pub async fn run(&self, market: Option<&str>, limit: i64) -> Result<FollowupRunStats> {
        let now = Utc::now();
        let due = self.store.followups_due(now, market, limit).await?;
        let mut stats = FollowupRunStats {
            due: due.len(),
            ..Default::default()
        };

        for lead_id in due {
            match self.process_one(lead_id).await {
                Ok(outcome) => match outcome {
                    FollowupOutcome::Sent => stats.sent += 1,
                    FollowupOutcome::Blocked => stats.blocked += 1,
                    FollowupOutcome::Skipped => stats.skipped += 1,
                    FollowupOutcome::Failed => stats.failed += 1,
                },
                Err(e) => {
                    // State already advanced; the send is lost, not
                    // repeated.
                    warn!(lead_id, error = %e, "followup dispatch raised");
                    stats.failed += 1;
                }
            }
        }

        info!(
            due = stats.due,
            sent = stats.sent,
            blocked = stats.blocked,
            "followup run complete"
        );
        Ok(stats)
    }

    async fn process_one(&self, lead_id: i64) -> Result<FollowupOutcome> {
        let Some(bundle) = self.store.get_lead_bundle(lead_id).await? else {
            return Ok(FollowupOutcome::Skipped);
        };

        // Gate before any state change.
        if let Err(blocked) = validate_can_send(&bundle.owner, &bundle.lead, false) {
            info!(lead_id, code = blocked.code.as_str(), "followup blocked");
            return Ok(FollowupOutcome::Blocked);
        }

        let max_followups = market_config(&bundle.lead.market_code).max_followups;
        if bundle.lead.followup_count >= max_followups {
            // Cap reached: stop scheduling, never send the fifth.
            self.store.clear_next_followup(lead_id).await?;
            return Ok(FollowupOutcome::Skipped);
        }

        let followup_num = bundle.lead.followup_count + 1;
        let context = if followup_num == 1 {
            MessageContext::Followup
        } else {
            MessageContext::Final
        };

        // State first: counters and the next slot commit before the
        // gateway is touched. The interval table is indexed by the
        // current followup count, same as the conversation engine.
        let now = Utc::now();
        let next = if followup_num < max_followups {
            Some(now + Duration::days(markets::followup_interval_days(bundle.lead.followup_count)))
        } else {
            None
        };
        self.store
            .advance_followup_state(lead_id, followup_num, now, next)
            .await?;

        let outcome = self
            .dispatcher
            .dispatch(lead_id, context, None, false)
            .await?;
        Ok(match outcome {
            DispatchOutcome::Completed(attempt)
                if matches!(attempt.status, AttemptStatus::Sent | AttemptStatus::DryRun) =>
            {
                FollowupOutcome::Sent
            }
            DispatchOutcome::Completed(_) => FollowupOutcome::Failed,
            DispatchOutcome::Duplicate(_) | DispatchOutcome::Locked => FollowupOutcome::Skipped,
            DispatchOutcome::Blocked(_) | DispatchOutcome::NotFound => FollowupOutcome::Blocked,
        })
    }
}

enum FollowupOutcome {
    Sent,
    Blocked,
    Skipped,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::SendLockService;
    use crate::resilience::{CircuitBreaker, RateLimiter};
    use crate::store::testutil::temp_store;
    use crate::store::IngestParcel;
    use std::time::Duration as StdDuration;

    async fn seed_due_lead(store: &Store, followup_count: i64) -> i64 {
        let (parcel_id, _) = store
            .upsert_parcel(&IngestParcel {
                canonical_parcel_id: "F1".into(),
                parish: "East Baton Rouge".into(),
                market_code: "LA".into(),
                lot_size_acres: Some(2.0),
                ..Default::default()
            })
            .await
            .unwrap();
        let (party_id, _) = store
            .upsert_party("hf", "JOHN DOE", "70801", "John Doe", None, "LA")
            .await
            .unwrap();
        let (owner_id, _) = store
            .ensure_owner(party_id, Some("+12255550147"), None, true)
            .await
            .unwrap();
        let (lead_id, _) = store.upsert_lead(owner_id, parcel_id, "LA").await.unwrap();

        let now = Utc::now();
        store
            .advance_followup_state(lead_id, followup_count, now, Some(now - Duration::minutes(1)))
            .await
            .unwrap();
        lead_id
    }

    fn scheduler(store: &Store, dry_run: bool) -> FollowupScheduler {
        let dispatcher = Arc::new(OutreachDispatcher::new(
            store.clone(),
            SendLockService::new(store.clone()),
            None,
            None,
            CircuitBreaker::new("llm", 3, StdDuration::from_secs(60)),
            CircuitBreaker::new("twilio", 5, StdDuration::from_secs(60)),
            RateLimiter::per_second("twilio", 10.0),
            dry_run,
        ));
        FollowupScheduler::new(store.clone(), dispatcher)
    }

    #[tokio::test]
    async fn due_followup_sends_and_advances() {
        let (store, _file) = temp_store();
        let lead_id = seed_due_lead(&store, 0).await;
        let scheduler = scheduler(&store, true);

        let stats = scheduler.run(None, 50).await.unwrap();
        assert_eq!(stats.due, 1);
        assert_eq!(stats.sent, 1);

        let lead = store.get_lead(lead_id).await.unwrap().unwrap();
        assert_eq!(lead.followup_count, 1);
        // First followup just went out: the next slot uses the first
        // interval in the table (3 days), not the second.
        let days = (lead.next_followup_at.unwrap() - Utc::now()).num_days();
        assert!((2..=3).contains(&days), "next interval was {days} days");

        let attempts = store.list_attempts(Some(lead_id), None, 10, 0).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].message_context, MessageContext::Followup);
    }

    #[tokio::test]
    async fn gateway_failure_still_advances_state() {
        let (store, _file) = temp_store();
        let lead_id = seed_due_lead(&store, 1).await;
        // Live mode with no gateway: the dispatch raises after
        // recording a failed attempt.
        let scheduler = scheduler(&store, false);

        let stats = scheduler.run(None, 50).await.unwrap();
        assert_eq!(stats.due, 1);
        assert_eq!(stats.failed, 1);

        // State-first: counter and slot advanced despite the failure.
        let lead = store.get_lead(lead_id).await.unwrap().unwrap();
        assert_eq!(lead.followup_count, 2);
        assert!(lead.next_followup_at.unwrap() > Utc::now());

        let attempts = store.list_attempts(Some(lead_id), None, 10, 0).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert!(attempts[0].error_message.is_some());

        // A same-day retry dispatch cannot produce a second send.
        let outcome = scheduler
            .dispatcher
            .dispatch(lead_id, MessageContext::Final, None, false)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Duplicate(_)));
    }

    #[tokio::test]
    async fn fifth_followup_is_never_sent() {
        let (store, _file) = temp_store();
        let lead_id = seed_due_lead(&store, 4).await;
        let scheduler = scheduler(&store, true);

        let stats = scheduler.run(None, 50).await.unwrap();
        assert_eq!(stats.due, 1);
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.skipped, 1);

        let lead = store.get_lead(lead_id).await.unwrap().unwrap();
        assert_eq!(lead.followup_count, 4);
        assert!(lead.next_followup_at.is_none());
        assert!(store
            .list_attempts(Some(lead_id), None, 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn final_context_after_first_followup() {
        let (store, _file) = temp_store();
        let lead_id = seed_due_lead(&store, 1).await;
        let scheduler = scheduler(&store, true);

        scheduler.run(None, 50).await.unwrap();
        let attempts = store.list_attempts(Some(lead_id), None, 10, 0).await.unwrap();
        assert_eq!(attempts[0].message_context, MessageContext::Final);
    }
}
