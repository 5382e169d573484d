//! In-memory implementation of the store traits.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crmsync_core::{
    ChangeQueueEntry, ChangeSource, ChangeStatus, Clock, EntityType, EntryId, ExternalId,
    GlobalId, LocalId, LocalRecord, QueueSummary, SystemClock, Timestamp,
};

use crate::error::{Result, StoreError};
use crate::traits::{ChangeQueue, CursorStore, EntityRepository, LocalStore, RemoteLink};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Queue entries, ordered by id (and therefore by creation).
    entries: BTreeMap<i64, ChangeQueueEntry>,
    next_entry: i64,

    /// Records indexed by local id.
    records: BTreeMap<i64, LocalRecord>,
    next_record: i64,

    cursors: HashMap<EntityType, Timestamp>,
}

impl MemoryStoreInner {
    fn enqueue(
        &mut self,
        entity_type: EntityType,
        local_id: LocalId,
        source: ChangeSource,
        now: Timestamp,
    ) -> EntryId {
        let existing = self.entries.values().find(|e| {
            e.entity_type == entity_type
                && e.local_id == local_id
                && e.source == source
                && e.status == ChangeStatus::Pending
        });
        if let Some(entry) = existing {
            return entry.id;
        }

        self.next_entry += 1;
        let id = EntryId(self.next_entry);
        let mut entry = ChangeQueueEntry::new(id, entity_type, local_id, source, now);
        if let Some(record) = self.records.get(&local_id.0) {
            entry.external_ref_id = record.meta.external_id.clone();
            entry.external_guid = record.meta.global_id.clone();
        }
        self.entries.insert(id.0, entry);
        id
    }

    fn save(&mut self, record: &LocalRecord, now: Timestamp) -> Result<LocalId> {
        let mut stored = record.clone();
        stored.meta.updated_at = now;

        let id = match record.id {
            None => {
                self.next_record += 1;
                LocalId(self.next_record)
            }
            Some(id) => {
                match self.records.get(&id.0) {
                    Some(existing) if existing.entity_type() == record.entity_type() => {}
                    _ => {
                        return Err(StoreError::NotFound(format!(
                            "{} {}",
                            record.entity_type(),
                            id
                        )))
                    }
                }
                id
            }
        };

        stored.id = Some(id);
        self.records.insert(id.0, stored);
        Ok(id)
    }

    fn entry_mut(&mut self, id: EntryId) -> Result<&mut ChangeQueueEntry> {
        self.entries
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::NotFound(format!("queue entry {}", id)))
    }

    fn settle(
        &mut self,
        id: EntryId,
        status: ChangeStatus,
        reason: Option<&str>,
        retry_increment: u32,
    ) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.status = status;
        entry.last_error = reason.map(str::to_string);
        entry.retry_count += retry_increment;
        entry.locked_at = None;
        Ok(())
    }

    fn records_of(&self, entity_type: EntityType) -> impl Iterator<Item = &LocalRecord> {
        self.records
            .values()
            .filter(move |r| r.entity_type() == entity_type)
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp bookkeeping columns from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryStoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryStoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeQueue for MemoryStore {
    async fn enqueue(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        source: ChangeSource,
    ) -> Result<EntryId> {
        let now = self.now();
        Ok(self.write().enqueue(entity_type, local_id, source, now))
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<ChangeQueueEntry>> {
        Ok(self.read().entries.get(&id.0).cloned())
    }

    async fn claim_batch(
        &self,
        entity_types: &[EntityType],
        source: ChangeSource,
        limit: usize,
    ) -> Result<Vec<ChangeQueueEntry>> {
        let inner = self.read();

        let mut batch: Vec<ChangeQueueEntry> = inner
            .entries
            .values()
            .filter(|e| {
                e.status.is_claimable()
                    && !e.is_locked()
                    && e.source == source
                    && (entity_types.is_empty() || entity_types.contains(&e.entity_type))
            })
            .cloned()
            .collect();

        batch.sort_by_key(|e| (e.created_at, e.id));
        batch.truncate(limit);
        Ok(batch)
    }

    async fn lock(&self, id: EntryId, now: Timestamp) -> Result<bool> {
        let mut inner = self.write();

        let Some(entry) = inner.entries.get(&id.0) else {
            return Ok(false);
        };
        if !entry.status.is_claimable() || entry.is_locked() {
            return Ok(false);
        }

        let key = (entry.entity_type, entry.local_id);
        let in_flight = inner.entries.values().any(|e| {
            e.status == ChangeStatus::Processing && (e.entity_type, e.local_id) == key
        });
        if in_flight {
            return Ok(false);
        }

        let entry = inner.entry_mut(id)?;
        entry.status = ChangeStatus::Processing;
        entry.locked_at = Some(now);
        Ok(true)
    }

    async fn unlock(&self, id: EntryId) -> Result<()> {
        let mut inner = self.write();
        if let Some(entry) = inner.entries.get_mut(&id.0) {
            if entry.status == ChangeStatus::Processing {
                entry.status = if entry.retry_count > 0 {
                    ChangeStatus::Retry
                } else {
                    ChangeStatus::Pending
                };
            }
            entry.locked_at = None;
        }
        Ok(())
    }

    async fn mark_processed(&self, id: EntryId) -> Result<()> {
        self.write().settle(id, ChangeStatus::Processed, None, 0)
    }

    async fn mark_skipped(&self, id: EntryId, reason: &str) -> Result<()> {
        self.write().settle(id, ChangeStatus::Skipped, Some(reason), 0)
    }

    async fn mark_error(&self, id: EntryId, reason: &str) -> Result<()> {
        self.write().settle(id, ChangeStatus::Error, Some(reason), 0)
    }

    async fn mark_retry(&self, id: EntryId, reason: &str) -> Result<()> {
        self.write().settle(id, ChangeStatus::Retry, Some(reason), 1)
    }

    async fn find_stale_locks(&self, locked_before: Timestamp) -> Result<Vec<ChangeQueueEntry>> {
        let inner = self.read();
        let mut stale: Vec<ChangeQueueEntry> = inner
            .entries
            .values()
            .filter(|e| matches!(e.locked_at, Some(at) if at < locked_before))
            .cloned()
            .collect();
        stale.sort_by_key(|e| (e.locked_at, e.id));
        Ok(stale)
    }

    async fn requeue(&self, id: EntryId) -> Result<bool> {
        let mut inner = self.write();
        match inner.entries.get_mut(&id.0) {
            Some(entry) if entry.status.is_terminal() => {
                entry.status = ChangeStatus::Pending;
                entry.retry_count = 0;
                entry.last_error = None;
                entry.locked_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn summary(&self) -> Result<QueueSummary> {
        let inner = self.read();
        let mut summary = QueueSummary::default();
        for entry in inner.entries.values() {
            summary.add(entry.status, 1);
        }
        Ok(summary)
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get_cursor(&self, entity_type: EntityType) -> Result<Option<Timestamp>> {
        Ok(self.read().cursors.get(&entity_type).copied())
    }

    async fn advance_cursor(&self, entity_type: EntityType, to: Timestamp) -> Result<Timestamp> {
        let mut inner = self.write();
        let cursor = inner.cursors.entry(entity_type).or_insert(to);
        *cursor = (*cursor).max(to);
        Ok(*cursor)
    }
}

#[async_trait]
impl EntityRepository for MemoryStore {
    async fn find_by_id(&self, entity_type: EntityType, id: LocalId) -> Result<Option<LocalRecord>> {
        Ok(self
            .read()
            .records
            .get(&id.0)
            .filter(|r| r.entity_type() == entity_type)
            .cloned())
    }

    async fn find_by_external_id(
        &self,
        entity_type: EntityType,
        external_id: &ExternalId,
    ) -> Result<Option<LocalRecord>> {
        Ok(self
            .read()
            .records_of(entity_type)
            .find(|r| r.meta.external_id.as_ref() == Some(external_id))
            .cloned())
    }

    async fn find_by_global_id(
        &self,
        entity_type: EntityType,
        global_id: &GlobalId,
    ) -> Result<Option<LocalRecord>> {
        Ok(self
            .read()
            .records_of(entity_type)
            .find(|r| r.meta.global_id.as_ref() == Some(global_id))
            .cloned())
    }

    async fn find_by_business_key(
        &self,
        entity_type: EntityType,
        key: &str,
    ) -> Result<Vec<LocalRecord>> {
        let key = key.trim();
        Ok(self
            .read()
            .records_of(entity_type)
            .filter(|r| r.business_key() == Some(key))
            .cloned()
            .collect())
    }

    async fn save(&self, record: &LocalRecord) -> Result<LocalId> {
        let now = self.now();
        self.write().save(record, now)
    }

    async fn soft_delete(&self, entity_type: EntityType, id: LocalId) -> Result<bool> {
        let now = self.now();
        let mut inner = self.write();
        match inner.records.get_mut(&id.0) {
            Some(record) if record.entity_type() == entity_type => {
                record.meta.deleted = true;
                record.meta.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn commit_upsert(
        &self,
        record: &LocalRecord,
        enqueue: Option<ChangeSource>,
    ) -> Result<(LocalId, Option<EntryId>)> {
        // Single write guard: both effects land together or not at all.
        let now = self.now();
        let mut inner = self.write();
        let local_id = inner.save(record, now)?;
        let entry =
            enqueue.map(|source| inner.enqueue(record.entity_type(), local_id, source, now));
        Ok((local_id, entry))
    }

    async fn link_remote(&self, link: &RemoteLink) -> Result<()> {
        let mut inner = self.write();

        let global_id = match inner.records.get_mut(&link.local_id.0) {
            Some(record) if record.entity_type() == link.entity_type => {
                record.meta.external_id = Some(link.external_id.clone());
                if let Some(gid) = &link.global_id {
                    record.meta.global_id = Some(gid.clone());
                }
                if let Some(at) = link.remote_modified_at {
                    record.meta.last_pulled_at = Some(at);
                }
                record.meta.global_id.clone()
            }
            _ => {
                return Err(StoreError::NotFound(format!(
                    "{} {}",
                    link.entity_type, link.local_id
                )))
            }
        };

        if let Some(entry) = link.entry.and_then(|id| inner.entries.get_mut(&id.0)) {
            entry.external_ref_id = Some(link.external_id.clone());
            entry.external_guid = global_id;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmsync_core::{EntityBody, Product};
    use proptest::prelude::*;

    fn product(sku: &str) -> LocalRecord {
        LocalRecord::new(EntityBody::Product(Product {
            sku: sku.into(),
            name: "Widget".into(),
            price_cents: 1_500,
            unit: "pcs".into(),
        }))
    }

    #[tokio::test]
    async fn test_commit_upsert_saves_and_enqueues() {
        let store = MemoryStore::new();
        let (id, entry) = store
            .commit_upsert(&product("W-1"), Some(ChangeSource::Remote))
            .await
            .unwrap();

        let entry = store.get_entry(entry.unwrap()).await.unwrap().unwrap();
        assert_eq!(entry.local_id, id);
        assert_eq!(entry.source, ChangeSource::Remote);
        assert_eq!(entry.status, ChangeStatus::Pending);

        // Saving the same record again updates in place
        let mut record = store.find_by_id(EntityType::Product, id).await.unwrap().unwrap();
        record.meta.last_pulled_at = Some(10);
        let (again, _) = store.commit_upsert(&record, None).await.unwrap();
        assert_eq!(again, id);
        assert_eq!(
            store.find_by_business_key(EntityType::Product, "W-1").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_lock_unlock_restores_claimable_state() {
        let store = MemoryStore::new();
        let id = store.save(&product("W-1")).await.unwrap();
        let entry = store.enqueue(EntityType::Product, id, ChangeSource::Local).await.unwrap();

        assert!(store.lock(entry, 100).await.unwrap());
        assert!(store
            .claim_batch(&[], ChangeSource::Local, 10)
            .await
            .unwrap()
            .is_empty());

        store.unlock(entry).await.unwrap();
        let e = store.get_entry(entry).await.unwrap().unwrap();
        assert_eq!(e.status, ChangeStatus::Pending);
        assert_eq!(e.locked_at, None);

        store.lock(entry, 200).await.unwrap();
        store.mark_retry(entry, "timeout").await.unwrap();
        store.lock(entry, 300).await.unwrap();
        store.unlock(entry).await.unwrap();
        assert_eq!(
            store.get_entry(entry).await.unwrap().unwrap().status,
            ChangeStatus::Retry
        );
    }

    #[tokio::test]
    async fn test_stale_locks_and_requeue() {
        let store = MemoryStore::new();
        let id = store.save(&product("W-1")).await.unwrap();
        let entry = store.enqueue(EntityType::Product, id, ChangeSource::Local).await.unwrap();
        store.lock(entry, 1_000).await.unwrap();

        assert!(store.find_stale_locks(1_000).await.unwrap().is_empty());
        assert_eq!(store.find_stale_locks(1_001).await.unwrap().len(), 1);

        // Requeue only applies to terminal entries
        assert!(!store.requeue(entry).await.unwrap());
        store.mark_error(entry, "rejected").await.unwrap();
        assert!(store.requeue(entry).await.unwrap());

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.error, 0);
    }

    #[tokio::test]
    async fn test_soft_delete_checks_type() {
        let store = MemoryStore::new();
        let id = store.save(&product("W-1")).await.unwrap();
        assert!(!store.soft_delete(EntityType::Order, id).await.unwrap());
        assert!(store.soft_delete(EntityType::Product, id).await.unwrap());
        let record = store.find_by_id(EntityType::Product, id).await.unwrap().unwrap();
        assert!(record.meta.deleted);
    }

    #[tokio::test]
    async fn test_bookkeeping_uses_injected_clock() {
        let clock = Arc::new(crmsync_core::ManualClock::new(5_000));
        let store = MemoryStore::new().with_clock(clock.clone());

        let a = store.save(&product("W-1")).await.unwrap();
        let first = store.enqueue(EntityType::Product, a, ChangeSource::Local).await.unwrap();
        clock.set(1_000);
        let b = store.save(&product("W-2")).await.unwrap();
        let second = store.enqueue(EntityType::Product, b, ChangeSource::Local).await.unwrap();

        let record = store.find_by_id(EntityType::Product, a).await.unwrap().unwrap();
        assert_eq!(record.meta.updated_at, 5_000);

        // Claim order follows the injected creation time, not insertion order
        let batch = store.claim_batch(&[], ChangeSource::Local, 10).await.unwrap();
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(batch[0].created_at, 1_000);
    }

    #[tokio::test]
    async fn test_link_remote_records_read_back_time() {
        let store = MemoryStore::new();
        let id = store.save(&product("W-1")).await.unwrap();
        let link = RemoteLink {
            entry: None,
            entity_type: EntityType::Product,
            local_id: id,
            external_id: ExternalId::new("9"),
            global_id: None,
            remote_modified_at: Some(7_000),
        };
        store.link_remote(&link).await.unwrap();
        let record = store.find_by_id(EntityType::Product, id).await.unwrap().unwrap();
        assert_eq!(record.meta.last_pulled_at, Some(7_000));

        // Without a read-back the previous value stays
        store
            .link_remote(&RemoteLink { remote_modified_at: None, ..link })
            .await
            .unwrap();
        let record = store.find_by_id(EntityType::Product, id).await.unwrap().unwrap();
        assert_eq!(record.meta.last_pulled_at, Some(7_000));
    }

    proptest! {
        #[test]
        fn cursor_never_moves_backwards(steps in prop::collection::vec(0i64..1_000_000, 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = MemoryStore::new();
                let mut high = i64::MIN;
                for step in &steps {
                    let after = store.advance_cursor(EntityType::Order, *step).await.unwrap();
                    high = high.max(*step);
                    assert_eq!(after, high);
                }
            });
        }
    }
}
