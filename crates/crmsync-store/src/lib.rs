//! # crmsync store
//!
//! Local persistence for the sync engine: the change queue, per-type pull
//! cursors and the repositories of locally mastered records.
//!
//! ## Overview
//!
//! Pipelines only talk to the [`LocalStore`] trait (itself the union of
//! [`ChangeQueue`], [`CursorStore`] and [`EntityRepository`]). The primary
//! implementation is [`SqliteStore`], with [`MemoryStore`] for testing.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use crmsync_core::{ChangeSource, EntityType};
//! use crmsync_store::{ChangeQueue, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("crmsync.db").unwrap();
//!
//!     let batch = store
//!         .claim_batch(&[EntityType::Order], ChangeSource::Local, 50)
//!         .await
//!         .unwrap();
//!     for entry in batch {
//!         if store.lock(entry.id, 0).await.unwrap() {
//!             // push, then mark_processed / mark_retry / ...
//!         }
//!     }
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **One in-flight entry per record**: `lock` refuses while another entry
//!   for the same `(entity_type, local_id)` is `processing`
//! - **Coalescing**: enqueueing a record that already has a `pending` entry
//!   from the same side returns that entry
//! - **Monotonic cursors**: `advance_cursor` never moves a cursor backwards
//! - **Atomic commits**: `commit_upsert` and `link_remote` are the only
//!   multi-row writes and run in a single transaction

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{ChangeQueue, CursorStore, EntityRepository, LocalStore, RemoteLink};
