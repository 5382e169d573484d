//! Lock & retry supervision.
//!
//! The supervisor is the only place that decides what happens to a queue
//! entry after a pipeline step. Pipelines report `Ok(())` or a
//! [`SyncError`]; the outcome follows from the error variant and the entry's
//! retry budget.

use serde::Serialize;

use crmsync_core::{ChangeQueueEntry, Timestamp};
use crmsync_store::{ChangeQueue, StoreError};

use crate::error::SyncError;

/// Final state an entry is moved to after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Retry,
    Error,
    Skipped,
}

/// Result of a stale lock sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Entries sent back for another attempt.
    pub retried: usize,
    /// Entries whose budget was exhausted.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    max_retries: u32,
}

impl Supervisor {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Whether one more failed attempt still fits in the budget.
    fn has_budget(&self, entry: &ChangeQueueEntry) -> bool {
        entry.retry_count.saturating_add(1) < self.max_retries
    }

    /// Decide the outcome of a failed attempt.
    pub fn classify(&self, entry: &ChangeQueueEntry, error: &SyncError) -> Outcome {
        match error {
            SyncError::Validation(_) | SyncError::Mapping(_) => Outcome::Skipped,
            e if !e.is_retryable() => Outcome::Error,
            _ if self.has_budget(entry) => Outcome::Retry,
            _ => Outcome::Error,
        }
    }

    /// Record the outcome of an attempt and release the entry's lock.
    ///
    /// Runs after any pipeline transaction has committed or rolled back, so
    /// the bookkeeping survives a failed step.
    pub async fn settle<Q: ChangeQueue + ?Sized>(
        &self,
        queue: &Q,
        entry: &ChangeQueueEntry,
        result: Result<(), SyncError>,
    ) -> Result<Outcome, StoreError> {
        let (outcome, recorded) = match result {
            Ok(()) => (Outcome::Processed, queue.mark_processed(entry.id).await),
            Err(error) => {
                let reason = error.to_string();
                let outcome = self.classify(entry, &error);
                let recorded = match outcome {
                    Outcome::Skipped => {
                        tracing::debug!(entry = %entry.id, %reason, "entry skipped");
                        queue.mark_skipped(entry.id, &reason).await
                    }
                    Outcome::Retry => {
                        tracing::debug!(
                            entry = %entry.id,
                            attempt = entry.retry_count + 1,
                            %reason,
                            "entry will be retried"
                        );
                        queue.mark_retry(entry.id, &reason).await
                    }
                    _ => {
                        if error.is_retryable() {
                            tracing::warn!(
                                entry = %entry.id,
                                entity_type = %entry.entity_type,
                                local_id = %entry.local_id,
                                attempts = entry.retry_count + 1,
                                %reason,
                                "retry budget exhausted"
                            );
                        } else {
                            tracing::debug!(entry = %entry.id, %reason, "entry rejected");
                        }
                        queue.mark_error(entry.id, &reason).await
                    }
                };
                (outcome, recorded)
            }
        };

        if let Err(e) = recorded {
            // Never leave the entry locked because bookkeeping failed.
            let _ = queue.unlock(entry.id).await;
            return Err(e);
        }
        Ok(outcome)
    }

    /// Release locks taken before `now - timeout_ms`, moving each entry to
    /// `retry` or, without budget left, to `error`.
    pub async fn reclaim_stale_locks<Q: ChangeQueue + ?Sized>(
        &self,
        queue: &Q,
        now: Timestamp,
        timeout_ms: i64,
    ) -> Result<ReclaimReport, StoreError> {
        let mut report = ReclaimReport::default();

        for entry in queue.find_stale_locks(now.saturating_sub(timeout_ms)).await? {
            let held_ms = entry.locked_at.map(|at| now - at).unwrap_or_default();
            let reason = format!("stale lock reclaimed after {} ms", held_ms);

            if self.has_budget(&entry) {
                tracing::warn!(
                    entry = %entry.id,
                    entity_type = %entry.entity_type,
                    held_ms,
                    "reclaiming stale lock for retry"
                );
                queue.mark_retry(entry.id, &reason).await?;
                report.retried += 1;
            } else {
                tracing::warn!(
                    entry = %entry.id,
                    entity_type = %entry.entity_type,
                    held_ms,
                    "reclaiming stale lock, retry budget exhausted"
                );
                queue.mark_error(entry.id, &reason).await?;
                report.failed += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteApiError;
    use crmsync_core::{ChangeSource, ChangeStatus, EntityType, EntryId, LocalId, ValidationError};
    use crmsync_store::MemoryStore;

    fn entry(retry_count: u32) -> ChangeQueueEntry {
        let mut e = ChangeQueueEntry::new(
            EntryId(1),
            EntityType::Contract,
            LocalId(1),
            ChangeSource::Local,
            0,
        );
        e.retry_count = retry_count;
        e
    }

    #[test]
    fn test_classification() {
        let sup = Supervisor::new(3);

        let validation = SyncError::from(ValidationError::MissingField("number"));
        assert_eq!(sup.classify(&entry(0), &validation), Outcome::Skipped);
        assert_eq!(sup.classify(&entry(2), &validation), Outcome::Skipped);

        let rejected = SyncError::from(RemoteApiError::from_status(422, "bad field"));
        assert_eq!(sup.classify(&entry(0), &rejected), Outcome::Error);

        let not_ready = SyncError::dependency_not_ready(EntityType::Counterparty, "#4");
        assert_eq!(sup.classify(&entry(0), &not_ready), Outcome::Retry);
        assert_eq!(sup.classify(&entry(1), &not_ready), Outcome::Retry);
        assert_eq!(sup.classify(&entry(2), &not_ready), Outcome::Error);

        let unexpected = SyncError::from(anyhow::anyhow!("socket closed"));
        assert_eq!(sup.classify(&entry(1), &unexpected), Outcome::Retry);
    }

    #[tokio::test]
    async fn test_settle_releases_lock() {
        let store = MemoryStore::new();
        let id = store
            .enqueue(EntityType::Contract, LocalId(1), ChangeSource::Local)
            .await
            .unwrap();
        assert!(store.lock(id, 10).await.unwrap());
        let locked = store.get_entry(id).await.unwrap().unwrap();

        let sup = Supervisor::new(5);
        let outcome = sup
            .settle(
                &store,
                &locked,
                Err(SyncError::dependency_not_ready(EntityType::Counterparty, "#9")),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Retry);

        let after = store.get_entry(id).await.unwrap().unwrap();
        assert_eq!(after.status, ChangeStatus::Retry);
        assert_eq!(after.retry_count, 1);
        assert_eq!(after.locked_at, None);
        assert!(after.last_error.unwrap().contains("dependency not ready"));
    }

    #[tokio::test]
    async fn test_reclaim_stale_locks() {
        let store = MemoryStore::new();
        let fresh = store
            .enqueue(EntityType::Order, LocalId(1), ChangeSource::Local)
            .await
            .unwrap();
        let stale = store
            .enqueue(EntityType::Order, LocalId(2), ChangeSource::Local)
            .await
            .unwrap();
        store.lock(stale, 1_000).await.unwrap();
        store.lock(fresh, 9_000).await.unwrap();

        let report = Supervisor::new(5)
            .reclaim_stale_locks(&store, 10_000, 5_000)
            .await
            .unwrap();
        assert_eq!(report, ReclaimReport { retried: 1, failed: 0 });

        let e = store.get_entry(stale).await.unwrap().unwrap();
        assert_eq!(e.status, ChangeStatus::Retry);
        assert_eq!(e.locked_at, None);
        assert_eq!(
            store.get_entry(fresh).await.unwrap().unwrap().status,
            ChangeStatus::Processing
        );
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn retryable_failures_never_exceed_budget(max in 1u32..10, count in 0u32..20) {
                let sup = Supervisor::new(max);
                let err = SyncError::dependency_not_ready(EntityType::Order, "#1");
                let outcome = sup.classify(&entry(count), &err);
                if count + 1 >= max {
                    prop_assert_eq!(outcome, Outcome::Error);
                } else {
                    prop_assert_eq!(outcome, Outcome::Retry);
                }
            }
        }
    }
}
