//! # crmsync
//!
//! Keeps locally mastered business records (organizations, counterparties,
//! contracts, products, orders) mirrored into a remote CRM, in both
//! directions, with no shared transaction between the two sides.
//!
//! ## Overview
//!
//! - **Change queue**: every local or remote change becomes a durable queue
//!   entry, processed under a per-record lock with a retry budget
//! - **Outbound**: queue entries are pushed to the CRM, creating or updating
//!   the remote record and linking it back
//! - **Inbound**: remote changes since a per-type cursor are pulled,
//!   reconciled with their local counterpart and upserted
//! - **Dependencies**: a record's parents are synchronized, on demand, before
//!   the record itself
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crmsync::{ServiceConfig, SyncService};
//! use crmsync::core::SystemClock;
//! use crmsync::store::SqliteStore;
//! use crmsync::sync::{MemoryCrm, StopSignal};
//!
//! async fn example() -> crmsync::Result<()> {
//!     let clock = Arc::new(SystemClock);
//!     let store = Arc::new(SqliteStore::open("crmsync.db")?);
//!     let crm = Arc::new(MemoryCrm::new(clock.clone()));
//!
//!     let service = SyncService::new(store, crm, clock, ServiceConfig::default());
//!
//!     let stop = StopSignal::new();
//!     let report = service.run_once(&stop).await?;
//!     println!("pushed {} local changes", report.local.processed);
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `crmsync::core` - Identifiers, entity bodies, validation
//! - `crmsync::store` - Change queue and repositories, SQLite and in-memory
//! - `crmsync::sync` - Pipelines, resolver, supervisor, remote API seam

pub mod error;
pub mod service;

pub use crmsync_core as core;
pub use crmsync_store as store;
pub use crmsync_sync as sync;

pub use error::{Result, ServiceError};
pub use service::{RunReport, ServiceConfig, SyncService};

pub use crmsync_core::{
    ChangeSource, ChangeStatus, EntityBody, EntityType, EntryId, ExternalId, GlobalId, LocalId,
    LocalRecord, QueueSummary,
};
pub use crmsync_sync::{DrainStats, PullStats, RemoteApi, StopSignal, SyncConfig};
