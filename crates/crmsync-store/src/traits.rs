//! Store traits: the abstract interface over local persistence.
//!
//! The pipelines only ever see these traits. Implementations include SQLite
//! (primary) and in-memory (for tests).

use async_trait::async_trait;
use crmsync_core::{
    ChangeQueueEntry, ChangeSource, EntityType, EntryId, ExternalId, GlobalId, LocalId,
    LocalRecord, QueueSummary, Timestamp,
};

use crate::error::Result;

/// Durable table of pending mutations.
///
/// # Design Notes
///
/// - **Lock = exclusivity**: `lock` is a single conditional update. It fails
///   when the entry is already locked, not claimable, or when another entry
///   for the same `(entity_type, local_id)` is being processed.
/// - **Immediate persistence**: every `mark_*` writes through and releases
///   the lock, independent of any pipeline transaction.
#[async_trait]
pub trait ChangeQueue: Send + Sync {
    /// Add a `pending` entry for a local record.
    ///
    /// If a `pending` entry with the same `(entity_type, local_id, source)`
    /// already exists its id is returned instead.
    async fn enqueue(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        source: ChangeSource,
    ) -> Result<EntryId>;

    async fn get_entry(&self, id: EntryId) -> Result<Option<ChangeQueueEntry>>;

    /// Claimable (`pending`/`retry`), unlocked entries, oldest first.
    ///
    /// An empty `entity_types` slice selects every type.
    async fn claim_batch(
        &self,
        entity_types: &[EntityType],
        source: ChangeSource,
        limit: usize,
    ) -> Result<Vec<ChangeQueueEntry>>;

    /// Take the entry for processing. Returns `false` if someone else has it.
    async fn lock(&self, id: EntryId, now: Timestamp) -> Result<bool>;

    /// Release a lock without recording an outcome.
    async fn unlock(&self, id: EntryId) -> Result<()>;

    async fn mark_processed(&self, id: EntryId) -> Result<()>;

    async fn mark_skipped(&self, id: EntryId, reason: &str) -> Result<()>;

    async fn mark_error(&self, id: EntryId, reason: &str) -> Result<()>;

    /// Record a retryable failure; increments `retry_count`.
    async fn mark_retry(&self, id: EntryId, reason: &str) -> Result<()>;

    /// Entries whose lock was taken before `locked_before`.
    async fn find_stale_locks(&self, locked_before: Timestamp) -> Result<Vec<ChangeQueueEntry>>;

    /// Move a terminal entry back to `pending` with a fresh retry budget.
    ///
    /// Returns `false` if the entry is not terminal.
    async fn requeue(&self, id: EntryId) -> Result<bool>;

    /// Per-status counts.
    async fn summary(&self) -> Result<QueueSummary>;
}

/// Per entity type pull cursors, owned by the inbound pipeline.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor(&self, entity_type: EntityType) -> Result<Option<Timestamp>>;

    /// Move the cursor forward to `to`. Never moves it backwards.
    ///
    /// Returns the cursor value after the call.
    async fn advance_cursor(&self, entity_type: EntityType, to: Timestamp) -> Result<Timestamp>;
}

/// Typed CRUD and lookups over locally mastered records.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn find_by_id(&self, entity_type: EntityType, id: LocalId) -> Result<Option<LocalRecord>>;

    async fn find_by_external_id(
        &self,
        entity_type: EntityType,
        external_id: &ExternalId,
    ) -> Result<Option<LocalRecord>>;

    async fn find_by_global_id(
        &self,
        entity_type: EntityType,
        global_id: &GlobalId,
    ) -> Result<Option<LocalRecord>>;

    /// All records carrying the business key, oldest first.
    ///
    /// Business keys are not unique: duplicates are tolerated.
    async fn find_by_business_key(
        &self,
        entity_type: EntityType,
        key: &str,
    ) -> Result<Vec<LocalRecord>>;

    /// Insert (when `record.id` is `None`) or update a record.
    async fn save(&self, record: &LocalRecord) -> Result<LocalId>;

    /// Set the soft-delete flag. Returns `false` if the record does not exist.
    async fn soft_delete(&self, entity_type: EntityType, id: LocalId) -> Result<bool>;
}

/// Remote identity to write back after a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLink {
    /// Queue entry that drove the push, if any.
    pub entry: Option<EntryId>,
    pub entity_type: EntityType,
    pub local_id: LocalId,
    pub external_id: ExternalId,
    /// Only overwrites the stored global id when `Some`.
    pub global_id: Option<GlobalId>,
    /// Remote modification time read back after the write. Recorded as
    /// `last_pulled_at` so the echo of our own push is not re-imported.
    pub remote_modified_at: Option<Timestamp>,
}

/// Everything the pipelines need from local persistence, plus the
/// multi-row writes that must be atomic.
#[async_trait]
pub trait LocalStore: ChangeQueue + CursorStore + EntityRepository {
    /// Save a record and optionally enqueue a change for it, atomically.
    async fn commit_upsert(
        &self,
        record: &LocalRecord,
        enqueue: Option<ChangeSource>,
    ) -> Result<(LocalId, Option<EntryId>)>;

    /// Persist a remote identity onto the record and its queue entry,
    /// atomically.
    async fn link_remote(&self, link: &RemoteLink) -> Result<()>;
}
