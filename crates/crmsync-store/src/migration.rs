//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use crmsync_core::{Clock, SystemClock};
use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, SystemClock.now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Pending mutations, drained by the outbound pipeline
        CREATE TABLE change_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            local_id INTEGER NOT NULL,
            external_ref_id TEXT,                  -- remote primary key, once known
            external_guid TEXT,                    -- global id, once known
            source TEXT NOT NULL,                  -- LOCAL | REMOTE
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            locked_at INTEGER,                     -- Unix ms, NULL when unlocked
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- At most one entry per record may be in flight
        CREATE UNIQUE INDEX idx_change_queue_in_flight
            ON change_queue(entity_type, local_id) WHERE status = 'processing';

        CREATE INDEX idx_change_queue_claim
            ON change_queue(status, source, entity_type, created_at);
        CREATE INDEX idx_change_queue_locked ON change_queue(locked_at)
            WHERE locked_at IS NOT NULL;

        -- Latest successfully pulled remote change per entity type
        CREATE TABLE sync_cursors (
            entity_type TEXT PRIMARY KEY,
            cursor INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Locally mastered records; the typed body is CBOR
        CREATE TABLE local_entities (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            external_ref_id TEXT,
            global_id TEXT,
            business_key TEXT,
            last_pulled_at INTEGER,
            deleted INTEGER NOT NULL DEFAULT 0,
            body BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX idx_local_entities_external ON local_entities(entity_type, external_ref_id);
        CREATE INDEX idx_local_entities_global ON local_entities(entity_type, global_id);
        CREATE INDEX idx_local_entities_business_key ON local_entities(entity_type, business_key);
        "#,
    )?;

    Ok(())
}
