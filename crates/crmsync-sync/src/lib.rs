//! # CRM Sync Engine
//!
//! Bidirectional synchronization between the local store and a remote CRM.
//!
//! ## Overview
//!
//! Local edits land in the change queue and are pushed out by the
//! **outbound** pipeline; remote edits are pulled in by the **inbound**
//! pipeline, which walks a per-type cursor over the remote modification
//! time. Both pipelines go through the same pieces:
//!
//! - [`reconcile`]: find the counterpart record on the other side
//!   (remote id, then global id, then business key)
//! - [`resolver`]: make sure linked parents exist and are fresh before a
//!   child is written
//! - [`supervisor`]: settle each queue entry as processed, retry, error or
//!   skipped, and reclaim locks left behind by crashed runs
//!
//! ## Key Properties
//!
//! - **At most one lock**: a record is processed by one run at a time
//! - **No ping-pong**: our own pushes are stamped and ignored when pulled back
//! - **Resumable**: the pull cursor only moves forward
//! - **Bounded retries**: transient failures retry up to the configured budget
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crmsync_core::{ChangeSource, EntityType, SystemClock};
//! use crmsync_store::MemoryStore;
//! use crmsync_sync::{MemoryCrm, RunContext, SyncConfig, SyncEngine};
//!
//! async fn example() -> crmsync_sync::Result<()> {
//!     let clock = Arc::new(SystemClock);
//!     let crm = Arc::new(MemoryCrm::new(clock.clone()));
//!     let engine = SyncEngine::new(Arc::new(MemoryStore::new()), crm, clock, SyncConfig::default());
//!
//!     let ctx = RunContext::new();
//!     let pulled = engine.pull(&ctx, EntityType::Counterparty).await?;
//!     let pushed = engine.drain_queue(&ctx, &[], ChangeSource::Local, None).await?;
//!     println!("pulled {}, pushed {}", pulled.total, pushed.processed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod entities;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod reconcile;
pub mod remote;
pub mod resolver;
pub mod supervisor;

pub use config::{CursorPolicy, DuplicateKeyPolicy, SyncConfig};
pub use context::{ResolvedParent, RunContext, StopSignal};
pub use engine::{EntityHandler, HandlerRegistry, SyncEngine};
pub use error::{ErrorKind, Result, SyncError};
pub use inbound::{is_foreign_change, ChangedItems, ImportOutcome, InboundPuller, PullStats};
pub use outbound::{DependencyBundle, DrainStats, OutboundProcessor};
pub use reconcile::{MatchKey, Matched};
pub use remote::{
    fields, memory::MemoryCrm, Fields, RemoteApi, RemoteApiError, RemoteEntities, RemoteItem,
    RemotePage,
};
pub use resolver::Dependencies;
pub use supervisor::{Outcome, ReclaimReport, Supervisor};
