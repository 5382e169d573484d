//! SQLite implementation of the store traits.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crmsync_core::{
    ChangeQueueEntry, ChangeSource, ChangeStatus, Clock, EntityBody, EntityType, EntryId,
    ExternalId, GlobalId, LocalId, LocalRecord, QueueSummary, SyncMeta, SystemClock, Timestamp,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{ChangeQueue, CursorStore, EntityRepository, LocalStore, RemoteLink};

const ENTRY_COLUMNS: &str = "id, entity_type, local_id, external_ref_id, external_guid, source,
     status, retry_count, locked_at, last_error, created_at";

const RECORD_COLUMNS: &str =
    "local_id, external_ref_id, global_id, last_pulled_at, deleted, body, updated_at";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
    /// Source of `created_at`/`updated_at` stamps.
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Stamp bookkeeping columns from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_column<T: std::str::FromStr>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e.to_string()))
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeQueueEntry> {
    let external_guid: Option<String> = row.get(4)?;
    let external_guid = external_guid
        .map(|g| GlobalId::parse(&g).map_err(|e| conversion_error(4, e.to_string())))
        .transpose()?;
    let retry_count: i64 = row.get(7)?;

    Ok(ChangeQueueEntry {
        id: EntryId(row.get(0)?),
        entity_type: parse_column(row, 1)?,
        local_id: LocalId(row.get(2)?),
        external_ref_id: row.get::<_, Option<String>>(3)?.map(ExternalId),
        external_guid,
        source: parse_column(row, 5)?,
        status: parse_column(row, 6)?,
        retry_count: retry_count.max(0) as u32,
        locked_at: row.get(8)?,
        last_error: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalRecord> {
    let global_id: Option<String> = row.get(2)?;
    let global_id = global_id
        .map(|g| GlobalId::parse(&g).map_err(|e| conversion_error(2, e.to_string())))
        .transpose()?;
    let body_bytes: Vec<u8> = row.get(5)?;
    let body: EntityBody = ciborium::from_reader(&body_bytes[..]).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, Type::Blob, e.to_string().into())
    })?;

    Ok(LocalRecord {
        id: Some(LocalId(row.get(0)?)),
        meta: SyncMeta {
            external_id: row.get::<_, Option<String>>(1)?.map(ExternalId),
            global_id,
            last_pulled_at: row.get(3)?,
            deleted: row.get::<_, i64>(4)? != 0,
            updated_at: row.get(6)?,
        },
        body,
    })
}

fn encode_body(body: &EntityBody) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(body, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn enqueue_in(
    conn: &Connection,
    entity_type: EntityType,
    local_id: LocalId,
    source: ChangeSource,
    now: Timestamp,
) -> Result<EntryId> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM change_queue
             WHERE entity_type = ?1 AND local_id = ?2 AND source = ?3 AND status = 'pending'
             ORDER BY id LIMIT 1",
            params![entity_type.as_str(), local_id.0, source.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        return Ok(EntryId(id));
    }

    conn.execute(
        "INSERT INTO change_queue (
            entity_type, local_id, external_ref_id, external_guid, source,
            status, retry_count, created_at, updated_at
        ) VALUES (
            ?1, ?2,
            (SELECT external_ref_id FROM local_entities WHERE local_id = ?2),
            (SELECT global_id FROM local_entities WHERE local_id = ?2),
            ?3, 'pending', 0, ?4, ?4
        )",
        params![entity_type.as_str(), local_id.0, source.as_str(), now],
    )?;

    Ok(EntryId(conn.last_insert_rowid()))
}

fn save_in(conn: &Connection, record: &LocalRecord, now: Timestamp) -> Result<LocalId> {
    let entity_type = record.entity_type();
    let body = encode_body(&record.body)?;
    let external_id = record.meta.external_id.as_ref().map(|e| e.as_str().to_string());
    let global_id = record.meta.global_id.as_ref().map(|g| g.as_str().to_string());
    let business_key = record.business_key().map(str::to_string);

    match record.id {
        None => {
            conn.execute(
                "INSERT INTO local_entities (
                    entity_type, external_ref_id, global_id, business_key,
                    last_pulled_at, deleted, body, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    entity_type.as_str(),
                    external_id,
                    global_id,
                    business_key,
                    record.meta.last_pulled_at,
                    record.meta.deleted as i64,
                    body,
                    now,
                ],
            )?;
            Ok(LocalId(conn.last_insert_rowid()))
        }
        Some(id) => {
            let changed = conn.execute(
                "UPDATE local_entities SET
                    external_ref_id = ?3, global_id = ?4, business_key = ?5,
                    last_pulled_at = ?6, deleted = ?7, body = ?8, updated_at = ?9
                 WHERE local_id = ?1 AND entity_type = ?2",
                params![
                    id.0,
                    entity_type.as_str(),
                    external_id,
                    global_id,
                    business_key,
                    record.meta.last_pulled_at,
                    record.meta.deleted as i64,
                    body,
                    now,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("{} {}", entity_type, id)));
            }
            Ok(id)
        }
    }
}

fn find_record(
    conn: &Connection,
    entity_type: EntityType,
    column: &str,
    value: Value,
) -> Result<Option<LocalRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM local_entities
         WHERE entity_type = ?1 AND {column} = ?2
         ORDER BY local_id LIMIT 1"
    );
    conn.query_row(
        &sql,
        params_from_iter([Value::Text(entity_type.as_str().to_string()), value]),
        row_to_record,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Update an entry's outcome and release its lock.
fn settle_entry(
    conn: &Connection,
    id: EntryId,
    status: ChangeStatus,
    reason: Option<&str>,
    retry_increment: i64,
    now: Timestamp,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE change_queue SET
            status = ?2,
            last_error = ?3,
            retry_count = retry_count + ?4,
            locked_at = NULL,
            updated_at = ?5
         WHERE id = ?1",
        params![id.0, status.as_str(), reason, retry_increment, now],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("queue entry {}", id)));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Change queue
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl ChangeQueue for SqliteStore {
    async fn enqueue(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        source: ChangeSource,
    ) -> Result<EntryId> {
        let now = self.now();
        self.blocking(move |conn| enqueue_in(conn, entity_type, local_id, source, now))
            .await
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<ChangeQueueEntry>> {
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM change_queue WHERE id = ?1"),
                params![id.0],
                row_to_entry,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn claim_batch(
        &self,
        entity_types: &[EntityType],
        source: ChangeSource,
        limit: usize,
    ) -> Result<Vec<ChangeQueueEntry>> {
        let entity_types = entity_types.to_vec();

        self.blocking(move |conn| {
            let mut values = vec![Value::Text(source.as_str().to_string())];
            let mut sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM change_queue
                 WHERE status IN ('pending', 'retry') AND locked_at IS NULL AND source = ?1"
            );

            if !entity_types.is_empty() {
                let placeholders: Vec<String> = (0..entity_types.len())
                    .map(|i| format!("?{}", i + 2))
                    .collect();
                sql.push_str(&format!(" AND entity_type IN ({})", placeholders.join(", ")));
                values.extend(
                    entity_types
                        .iter()
                        .map(|t| Value::Text(t.as_str().to_string())),
                );
            }

            sql.push_str(&format!(" ORDER BY created_at, id LIMIT ?{}", values.len() + 1));
            values.push(Value::Integer(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params_from_iter(values), row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn lock(&self, id: EntryId, now: Timestamp) -> Result<bool> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE change_queue SET status = 'processing', locked_at = ?2, updated_at = ?2
                 WHERE id = ?1
                   AND status IN ('pending', 'retry')
                   AND locked_at IS NULL
                   AND NOT EXISTS (
                       SELECT 1 FROM change_queue AS other
                       WHERE other.entity_type = change_queue.entity_type
                         AND other.local_id = change_queue.local_id
                         AND other.status = 'processing'
                   )",
                params![id.0, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn unlock(&self, id: EntryId) -> Result<()> {
        let now = self.now();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE change_queue SET
                    status = CASE
                        WHEN status != 'processing' THEN status
                        WHEN retry_count > 0 THEN 'retry'
                        ELSE 'pending'
                    END,
                    locked_at = NULL,
                    updated_at = ?2
                 WHERE id = ?1",
                params![id.0, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_processed(&self, id: EntryId) -> Result<()> {
        let now = self.now();
        self.blocking(move |conn| settle_entry(conn, id, ChangeStatus::Processed, None, 0, now))
            .await
    }

    async fn mark_skipped(&self, id: EntryId, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        let now = self.now();
        self.blocking(move |conn| {
            settle_entry(conn, id, ChangeStatus::Skipped, Some(&reason), 0, now)
        })
        .await
    }

    async fn mark_error(&self, id: EntryId, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        let now = self.now();
        self.blocking(move |conn| {
            settle_entry(conn, id, ChangeStatus::Error, Some(&reason), 0, now)
        })
            .await
    }

    async fn mark_retry(&self, id: EntryId, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        let now = self.now();
        self.blocking(move |conn| {
            settle_entry(conn, id, ChangeStatus::Retry, Some(&reason), 1, now)
        })
            .await
    }

    async fn find_stale_locks(&self, locked_before: Timestamp) -> Result<Vec<ChangeQueueEntry>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM change_queue
                 WHERE locked_at IS NOT NULL AND locked_at < ?1
                 ORDER BY locked_at, id"
            ))?;
            let entries = stmt
                .query_map(params![locked_before], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn requeue(&self, id: EntryId) -> Result<bool> {
        let now = self.now();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE change_queue SET
                    status = 'pending', retry_count = 0, last_error = NULL,
                    locked_at = NULL, updated_at = ?2
                 WHERE id = ?1 AND status IN ('error', 'skipped', 'processed')",
                params![id.0, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn summary(&self) -> Result<QueueSummary> {
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM change_queue GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| {
                    let status: ChangeStatus = parse_column(row, 0)?;
                    let count: i64 = row.get(1)?;
                    Ok((status, count as u64))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut summary = QueueSummary::default();
            for (status, count) in rows {
                summary.add(status, count);
            }
            Ok(summary)
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cursors
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for SqliteStore {
    async fn get_cursor(&self, entity_type: EntityType) -> Result<Option<Timestamp>> {
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT cursor FROM sync_cursors WHERE entity_type = ?1",
                params![entity_type.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn advance_cursor(&self, entity_type: EntityType, to: Timestamp) -> Result<Timestamp> {
        let now = self.now();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO sync_cursors (entity_type, cursor, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(entity_type) DO UPDATE SET
                    cursor = MAX(cursor, excluded.cursor),
                    updated_at = excluded.updated_at",
                params![entity_type.as_str(), to, now],
            )?;
            conn.query_row(
                "SELECT cursor FROM sync_cursors WHERE entity_type = ?1",
                params![entity_type.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Repositories
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl EntityRepository for SqliteStore {
    async fn find_by_id(&self, entity_type: EntityType, id: LocalId) -> Result<Option<LocalRecord>> {
        self.blocking(move |conn| find_record(conn, entity_type, "local_id", Value::Integer(id.0)))
            .await
    }

    async fn find_by_external_id(
        &self,
        entity_type: EntityType,
        external_id: &ExternalId,
    ) -> Result<Option<LocalRecord>> {
        let value = Value::Text(external_id.as_str().to_string());
        self.blocking(move |conn| find_record(conn, entity_type, "external_ref_id", value))
            .await
    }

    async fn find_by_global_id(
        &self,
        entity_type: EntityType,
        global_id: &GlobalId,
    ) -> Result<Option<LocalRecord>> {
        let value = Value::Text(global_id.as_str().to_string());
        self.blocking(move |conn| find_record(conn, entity_type, "global_id", value))
            .await
    }

    async fn find_by_business_key(
        &self,
        entity_type: EntityType,
        key: &str,
    ) -> Result<Vec<LocalRecord>> {
        let key = key.trim().to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM local_entities
                 WHERE entity_type = ?1 AND business_key = ?2
                 ORDER BY local_id"
            ))?;
            let records = stmt
                .query_map(params![entity_type.as_str(), key], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn save(&self, record: &LocalRecord) -> Result<LocalId> {
        let record = record.clone();
        let now = self.now();
        self.blocking(move |conn| save_in(conn, &record, now)).await
    }

    async fn soft_delete(&self, entity_type: EntityType, id: LocalId) -> Result<bool> {
        let now = self.now();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE local_entities SET deleted = 1, updated_at = ?3
                 WHERE local_id = ?1 AND entity_type = ?2",
                params![id.0, entity_type.as_str(), now],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn commit_upsert(
        &self,
        record: &LocalRecord,
        enqueue: Option<ChangeSource>,
    ) -> Result<(LocalId, Option<EntryId>)> {
        let record = record.clone();
        let now = self.now();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let local_id = save_in(&tx, &record, now)?;
            let entry = enqueue
                .map(|source| enqueue_in(&tx, record.entity_type(), local_id, source, now))
                .transpose()?;
            tx.commit()?;
            Ok((local_id, entry))
        })
        .await
    }

    async fn link_remote(&self, link: &RemoteLink) -> Result<()> {
        let link = link.clone();
        let now = self.now();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE local_entities SET
                    external_ref_id = ?3,
                    global_id = COALESCE(?4, global_id),
                    last_pulled_at = COALESCE(?5, last_pulled_at)
                 WHERE local_id = ?1 AND entity_type = ?2",
                params![
                    link.local_id.0,
                    link.entity_type.as_str(),
                    link.external_id.as_str(),
                    link.global_id.as_ref().map(|g| g.as_str()),
                    link.remote_modified_at,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!(
                    "{} {}",
                    link.entity_type, link.local_id
                )));
            }

            if let Some(entry) = link.entry {
                tx.execute(
                    "UPDATE change_queue SET
                        external_ref_id = ?2,
                        external_guid = (SELECT global_id FROM local_entities WHERE local_id = ?3),
                        updated_at = ?4
                     WHERE id = ?1",
                    params![entry.0, link.external_id.as_str(), link.local_id.0, now],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmsync_core::{Counterparty, CounterpartyKind};

    fn counterparty(name: &str, tax_id: &str) -> LocalRecord {
        LocalRecord::new(EntityBody::Counterparty(Counterparty {
            name: name.into(),
            kind: CounterpartyKind::LegalEntity,
            tax_id: Some(tax_id.into()),
            phone: None,
            email: None,
        }))
    }

    #[tokio::test]
    async fn test_save_and_find_record() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.save(&counterparty("Acme", "7707083893")).await.unwrap();

        let found = store
            .find_by_id(EntityType::Counterparty, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, Some(id));
        assert_eq!(found.business_key(), Some("7707083893"));

        // Wrong entity type does not match
        assert!(store.find_by_id(EntityType::Product, id).await.unwrap().is_none());

        let by_key = store
            .find_by_business_key(EntityType::Counterparty, "7707083893")
            .await
            .unwrap();
        assert_eq!(by_key.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let store = SqliteStore::open_memory().unwrap();
        let mut record = counterparty("Ghost", "7707083893");
        record.id = Some(LocalId(42));
        assert!(matches!(
            store.save(&record).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_coalesces_pending() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.save(&counterparty("Acme", "7707083893")).await.unwrap();

        let e1 = store.enqueue(EntityType::Counterparty, id, ChangeSource::Local).await.unwrap();
        let e2 = store.enqueue(EntityType::Counterparty, id, ChangeSource::Local).await.unwrap();
        let e3 = store.enqueue(EntityType::Counterparty, id, ChangeSource::Remote).await.unwrap();
        assert_eq!(e1, e2);
        assert_ne!(e1, e3);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_per_record() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.save(&counterparty("Acme", "7707083893")).await.unwrap();
        let local = store.enqueue(EntityType::Counterparty, id, ChangeSource::Local).await.unwrap();
        let remote = store.enqueue(EntityType::Counterparty, id, ChangeSource::Remote).await.unwrap();

        assert!(store.lock(local, 1_000).await.unwrap());
        assert!(!store.lock(local, 1_001).await.unwrap());
        // Same record, different entry: still excluded while the first is in flight
        assert!(!store.lock(remote, 1_002).await.unwrap());

        store.mark_processed(local).await.unwrap();
        assert!(store.lock(remote, 1_003).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_batch_order_and_filters() {
        let store = SqliteStore::open_memory().unwrap();
        let a = store.save(&counterparty("A", "7707083893")).await.unwrap();
        let b = store.save(&counterparty("B", "7707083893")).await.unwrap();

        let e1 = store.enqueue(EntityType::Counterparty, a, ChangeSource::Local).await.unwrap();
        let e2 = store.enqueue(EntityType::Counterparty, b, ChangeSource::Local).await.unwrap();
        store.enqueue(EntityType::Counterparty, b, ChangeSource::Remote).await.unwrap();

        let batch = store
            .claim_batch(&[EntityType::Counterparty], ChangeSource::Local, 10)
            .await
            .unwrap();
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![e1, e2]);

        store.lock(e1, 0).await.unwrap();
        let batch = store.claim_batch(&[], ChangeSource::Local, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, e2);

        let none = store
            .claim_batch(&[EntityType::Order], ChangeSource::Local, 10)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_mark_retry_increments_and_releases() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.save(&counterparty("Acme", "7707083893")).await.unwrap();
        let entry = store.enqueue(EntityType::Counterparty, id, ChangeSource::Local).await.unwrap();

        store.lock(entry, 5).await.unwrap();
        store.mark_retry(entry, "remote timeout").await.unwrap();

        let e = store.get_entry(entry).await.unwrap().unwrap();
        assert_eq!(e.status, ChangeStatus::Retry);
        assert_eq!(e.retry_count, 1);
        assert_eq!(e.locked_at, None);
        assert_eq!(e.last_error.as_deref(), Some("remote timeout"));
    }

    #[tokio::test]
    async fn test_cursor_is_monotonic() {
        let store = SqliteStore::open_memory().unwrap();
        assert_eq!(store.get_cursor(EntityType::Order).await.unwrap(), None);

        assert_eq!(store.advance_cursor(EntityType::Order, 100).await.unwrap(), 100);
        assert_eq!(store.advance_cursor(EntityType::Order, 50).await.unwrap(), 100);
        assert_eq!(store.advance_cursor(EntityType::Order, 150).await.unwrap(), 150);
        assert_eq!(store.get_cursor(EntityType::Contract).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_link_remote_updates_record_and_entry() {
        let store = SqliteStore::open_memory().unwrap();
        let (id, entry) = store
            .commit_upsert(&counterparty("Acme", "7707083893"), Some(ChangeSource::Local))
            .await
            .unwrap();
        let entry = entry.unwrap();
        let gid = GlobalId::generate();

        store
            .link_remote(&RemoteLink {
                entry: Some(entry),
                entity_type: EntityType::Counterparty,
                local_id: id,
                external_id: ExternalId::new("17"),
                global_id: Some(gid.clone()),
                remote_modified_at: Some(4_200),
            })
            .await
            .unwrap();

        let record = store
            .find_by_external_id(EntityType::Counterparty, &ExternalId::new("17"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.meta.global_id, Some(gid.clone()));
        assert_eq!(record.meta.last_pulled_at, Some(4_200));

        let e = store.get_entry(entry).await.unwrap().unwrap();
        assert_eq!(e.external_ref_id, Some(ExternalId::new("17")));
        assert_eq!(e.external_guid, Some(gid));
    }

    #[tokio::test]
    async fn test_queue_stamps_follow_injected_clock() {
        let clock = Arc::new(crmsync_core::ManualClock::new(9_000));
        let store = SqliteStore::open_memory().unwrap().with_clock(clock.clone());
        let a = store.save(&counterparty("A", "7707083893")).await.unwrap();
        let b = store.save(&counterparty("B", "7707083893")).await.unwrap();

        let late = store.enqueue(EntityType::Counterparty, a, ChangeSource::Local).await.unwrap();
        clock.set(3_000);
        let early = store.enqueue(EntityType::Counterparty, b, ChangeSource::Local).await.unwrap();

        let batch = store.claim_batch(&[], ChangeSource::Local, 10).await.unwrap();
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![early, late]);
        assert_eq!(batch[0].created_at, 3_000);
        assert_eq!(batch[1].created_at, 9_000);

        let record = store.find_by_id(EntityType::Counterparty, a).await.unwrap().unwrap();
        assert_eq!(record.meta.updated_at, 9_000);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        let id = {
            let store = SqliteStore::open(&path).unwrap();
            let id = store.save(&counterparty("Acme", "7707083893")).await.unwrap();
            store.advance_cursor(EntityType::Counterparty, 77).await.unwrap();
            id
        };

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.find_by_id(EntityType::Counterparty, id).await.unwrap().is_some());
        assert_eq!(store.get_cursor(EntityType::Counterparty).await.unwrap(), Some(77));
    }
}
