//! Change queue entries: one pending mutation each.

use serde::{Deserialize, Serialize};

use crate::types::{
    ChangeSource, ChangeStatus, EntityType, EntryId, ExternalId, GlobalId, LocalId, Timestamp,
};

/// One pending mutation of a local aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeQueueEntry {
    pub id: EntryId,
    pub entity_type: EntityType,
    pub local_id: LocalId,
    /// Remote primary key, once known.
    pub external_ref_id: Option<ExternalId>,
    /// Global identity, once known.
    pub external_guid: Option<GlobalId>,
    pub source: ChangeSource,
    pub status: ChangeStatus,
    pub retry_count: u32,
    /// Set while a worker holds the entry.
    pub locked_at: Option<Timestamp>,
    /// Human readable reason of the last failure.
    pub last_error: Option<String>,
    pub created_at: Timestamp,
}

impl ChangeQueueEntry {
    /// Build a fresh `pending` entry. The id is assigned by the store.
    pub fn new(
        id: EntryId,
        entity_type: EntityType,
        local_id: LocalId,
        source: ChangeSource,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            entity_type,
            local_id,
            external_ref_id: None,
            external_guid: None,
            source,
            status: ChangeStatus::Pending,
            retry_count: 0,
            locked_at: None,
            last_error: None,
            created_at,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Whether the lock is older than `timeout_ms` at `now`.
    pub fn is_lock_stale(&self, now: Timestamp, timeout_ms: i64) -> bool {
        match self.locked_at {
            Some(at) => now.saturating_sub(at) > timeout_ms,
            None => false,
        }
    }
}

/// Per-status counts of the queue, for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub pending: u64,
    pub processing: u64,
    pub retry: u64,
    pub error: u64,
    pub skipped: u64,
    pub processed: u64,
}

impl QueueSummary {
    pub fn add(&mut self, status: ChangeStatus, count: u64) {
        match status {
            ChangeStatus::Pending => self.pending += count,
            ChangeStatus::Processing => self.processing += count,
            ChangeStatus::Retry => self.retry += count,
            ChangeStatus::Error => self.error += count,
            ChangeStatus::Skipped => self.skipped += count,
            ChangeStatus::Processed => self.processed += count,
        }
    }

    /// Entries still waiting for a worker.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.retry + self.processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_is_pending_and_unlocked() {
        let entry = ChangeQueueEntry::new(
            EntryId(1),
            EntityType::Contract,
            LocalId(7),
            ChangeSource::Local,
            1_000,
        );
        assert_eq!(entry.status, ChangeStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert!(!entry.is_locked());
        assert!(!entry.is_lock_stale(10_000_000, 1));
    }

    #[test]
    fn test_lock_staleness() {
        let mut entry = ChangeQueueEntry::new(
            EntryId(1),
            EntityType::Order,
            LocalId(1),
            ChangeSource::Remote,
            0,
        );
        entry.locked_at = Some(1_000);
        assert!(!entry.is_lock_stale(1_500, 1_000));
        assert!(entry.is_lock_stale(2_001, 1_000));
    }

    #[test]
    fn test_summary_outstanding() {
        let mut summary = QueueSummary::default();
        summary.add(ChangeStatus::Pending, 3);
        summary.add(ChangeStatus::Retry, 2);
        summary.add(ChangeStatus::Processed, 10);
        assert_eq!(summary.outstanding(), 5);
        assert_eq!(summary.processed, 10);
    }
}
