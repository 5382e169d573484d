//! The sync service: the scheduler boundary over the engine.
//!
//! A run pulls every configured entity type (parents first), then drains
//! the queue: `REMOTE` entries produced by the pull, then `LOCAL` entries
//! produced by domain operations. Every run gets a fresh [`RunContext`], so
//! resolver caches never outlive it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crmsync_core::{
    ChangeQueueEntry, ChangeSource, Clock, EntityType, EntryId, LocalId, LocalRecord,
    QueueSummary,
};
use crmsync_store::LocalStore;
use crmsync_sync::{
    DrainStats, HandlerRegistry, PullStats, ReclaimReport, RemoteApi, RunContext, StopSignal,
    SyncConfig, SyncEngine, SyncError,
};

use crate::error::{Result, ServiceError};

/// Granularity at which an idle service notices a stop request.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Configuration for the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Engine configuration.
    pub sync: SyncConfig,
    /// Entity types to pull, in order. Parents should come first.
    pub entity_types: Vec<EntityType>,
    /// Pause between runs of [`SyncService::run_until_stopped`].
    pub poll_interval: Duration,
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self {
            sync: SyncConfig::default(),
            entity_types: EntityType::ALL.to_vec(),
            poll_interval: Duration::from_secs(60),
        }
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_entity_types(mut self, entity_types: impl Into<Vec<EntityType>>) -> Self {
        self.entity_types = entity_types.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub reclaimed: ReclaimReport,
    pub pulls: Vec<(EntityType, PullStats)>,
    /// Types whose pull failed as a whole (e.g. the listing call).
    pub failed_pulls: Vec<EntityType>,
    pub remote: DrainStats,
    pub local: DrainStats,
    pub stopped: bool,
}

impl RunReport {
    pub fn pull_stats(&self, entity_type: EntityType) -> Option<&PullStats> {
        self.pulls
            .iter()
            .find(|(t, _)| *t == entity_type)
            .map(|(_, stats)| stats)
    }
}

/// The main service struct.
///
/// Provides:
/// - Pulling remote changes per entity type
/// - Draining the change queue outbound
/// - Whole runs, once or until stopped
/// - Recording local changes and operator queue actions
pub struct SyncService<S: LocalStore, A: RemoteApi> {
    engine: SyncEngine<S, A>,
    config: ServiceConfig,
}

impl<S: LocalStore, A: RemoteApi> SyncService<S, A> {
    pub fn new(store: Arc<S>, api: Arc<A>, clock: Arc<dyn Clock>, config: ServiceConfig) -> Self {
        let engine = SyncEngine::new(store, api, clock, config.sync.clone());
        Self { engine, config }
    }

    /// Replace the standard entity handlers.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.engine = self.engine.with_registry(registry);
        self
    }

    pub fn engine(&self) -> &SyncEngine<S, A> {
        &self.engine
    }

    pub fn store(&self) -> &S {
        self.engine.store()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduler Boundary
    // ─────────────────────────────────────────────────────────────────────────

    /// Pull remote changes of one entity type.
    pub async fn pull(&self, entity_type: EntityType) -> Result<PullStats> {
        let ctx = RunContext::new();
        Ok(self.engine.pull(&ctx, entity_type).await?)
    }

    /// Push queued changes of `source` for the given types (all when empty).
    pub async fn drain_queue(
        &self,
        entity_types: &[EntityType],
        source: ChangeSource,
        limit: Option<usize>,
    ) -> Result<DrainStats> {
        let ctx = RunContext::new();
        Ok(self
            .engine
            .drain_queue(&ctx, entity_types, source, limit)
            .await?)
    }

    /// One full run: reclaim stale locks, pull each type, drain the queue.
    ///
    /// A pull that fails as a whole is logged and the run continues with
    /// the next type; store failures end the run.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_once(&self, stop: &StopSignal) -> Result<RunReport> {
        let ctx = RunContext::with_stop(stop.clone());
        let mut report = RunReport {
            reclaimed: self.engine.reclaim_stale_locks().await?,
            ..RunReport::default()
        };

        for &entity_type in &self.config.entity_types {
            if ctx.stop_requested() {
                report.stopped = true;
                break;
            }
            match self.engine.pull(&ctx, entity_type).await {
                Ok(stats) => {
                    report.stopped |= stats.stopped;
                    report.pulls.push((entity_type, stats));
                }
                Err(SyncError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(%entity_type, error = %e, "pull failed");
                    report.failed_pulls.push(entity_type);
                }
            }
        }

        for source in [ChangeSource::Remote, ChangeSource::Local] {
            if report.stopped || ctx.stop_requested() {
                report.stopped = true;
                break;
            }
            let stats = self
                .engine
                .drain_queue(&ctx, &self.config.entity_types, source, None)
                .await?;
            report.stopped |= stats.stopped;
            match source {
                ChangeSource::Remote => report.remote = stats,
                ChangeSource::Local => report.local = stats,
            }
        }

        tracing::info!(
            reclaimed = report.reclaimed.retried + report.reclaimed.failed,
            pulled = report.pulls.iter().map(|(_, s)| s.total).sum::<usize>(),
            failed_pulls = report.failed_pulls.len(),
            pushed_remote = report.remote.processed,
            pushed_local = report.local.processed,
            stopped = report.stopped,
            "run finished"
        );
        Ok(report)
    }

    /// Run repeatedly, `poll_interval` apart, until `stop` is requested.
    ///
    /// Returns the number of completed runs. The run in flight when the stop
    /// arrives finishes its current entry first.
    pub async fn run_until_stopped(&self, stop: StopSignal) -> Result<usize> {
        let mut runs = 0;
        while !stop.is_stop_requested() {
            self.run_once(&stop).await?;
            runs += 1;

            let mut idle = Duration::ZERO;
            while idle < self.config.poll_interval && !stop.is_stop_requested() {
                let tick = STOP_POLL.min(self.config.poll_interval - idle);
                tokio::time::sleep(tick).await;
                idle += tick;
            }
        }
        tracing::info!(runs, "service stopped");
        Ok(runs)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Changes
    // ─────────────────────────────────────────────────────────────────────────

    /// Save a locally edited record and enqueue it for pushing.
    ///
    /// This is the hook domain operations call; the save and the queue
    /// entry commit together.
    pub async fn record_local_change(&self, record: &LocalRecord) -> Result<(LocalId, EntryId)> {
        let (local_id, entry) = self
            .store()
            .commit_upsert(record, Some(ChangeSource::Local))
            .await?;
        let entry = entry.ok_or_else(|| {
            ServiceError::InvalidOperation(format!("no queue entry for {local_id}"))
        })?;
        tracing::debug!(entity_type = %record.entity_type(), %local_id, %entry, "local change recorded");
        Ok((local_id, entry))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operator Actions
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn entry(&self, id: EntryId) -> Result<Option<ChangeQueueEntry>> {
        Ok(self.store().get_entry(id).await?)
    }

    /// Send a terminal entry back to `pending` with a fresh retry budget.
    pub async fn requeue(&self, id: EntryId) -> Result<()> {
        if self.store().requeue(id).await? {
            tracing::info!(entry = %id, "entry requeued");
            Ok(())
        } else {
            Err(ServiceError::InvalidOperation(format!(
                "entry {id} is not in a terminal state"
            )))
        }
    }

    /// Per-status counts of the change queue.
    pub async fn queue_summary(&self) -> Result<QueueSummary> {
        Ok(self.store().summary().await?)
    }
}
