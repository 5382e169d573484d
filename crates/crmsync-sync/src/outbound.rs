//! Outbound sync pipeline (local -> remote).
//!
//! One [`OutboundProcessor`] per entity type validates a record, resolves
//! its cross-entity links to remote ids, maps it to a remote payload, and
//! creates or updates the remote record. The driver
//! ([`SyncEngine::drain_queue`]) wraps each queue entry end to end: lock,
//! push, commit the remote identity, then let the supervisor record the
//! outcome.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crmsync_core::{
    validate_body, ChangeQueueEntry, ChangeSource, EntityType, EntryId, ExternalId, LocalId,
    LocalRecord, Timestamp, ValidationError,
};
use crmsync_store::{LocalStore, RemoteLink};

use crate::config::DuplicateKeyPolicy;
use crate::context::RunContext;
use crate::engine::{EntityHandler, SyncEngine};
use crate::error::{Result, SyncError};
use crate::reconcile::{self, Matched};
use crate::remote::{fields, Fields, RemoteApi, RemoteEntities};
use crate::resolver::Dependencies;
use crate::supervisor::Outcome;

/// Remote ids of the records a body links to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyBundle {
    remote_ids: HashMap<(EntityType, LocalId), ExternalId>,
}

impl DependencyBundle {
    pub fn insert(&mut self, entity_type: EntityType, local_id: LocalId, remote_id: ExternalId) {
        self.remote_ids.insert((entity_type, local_id), remote_id);
    }

    pub fn get(&self, entity_type: EntityType, local_id: LocalId) -> Option<&ExternalId> {
        self.remote_ids.get(&(entity_type, local_id))
    }

    /// The remote id of a link the mapper cannot do without.
    pub fn require(&self, entity_type: EntityType, local_id: LocalId) -> Result<&ExternalId> {
        self.get(entity_type, local_id)
            .ok_or_else(|| SyncError::dependency_not_ready(entity_type, local_id))
    }

    pub fn len(&self) -> usize {
        self.remote_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remote_ids.is_empty()
    }
}

/// Per entity type push logic.
///
/// Only [`map_fields`](Self::map_fields) is entity specific; the other steps
/// have defaults that work from [`EntityBody`](crmsync_core::EntityBody)
/// alone.
#[async_trait]
pub trait OutboundProcessor: EntityHandler {
    /// Refuse records that must not reach the remote side.
    fn validate(&self, record: &LocalRecord) -> Result<()> {
        if record.meta.deleted {
            return Err(ValidationError::Deleted {
                entity_type: record.entity_type(),
                id: record.id.unwrap_or(LocalId(0)),
            }
            .into());
        }
        validate_body(&record.body)?;
        Ok(())
    }

    /// Remote ids for every record this one links to.
    ///
    /// Fails with `DependencyNotReady` when a parent cannot be obtained even
    /// after asking the dependency resolver.
    async fn resolve_dependencies(
        &self,
        record: &LocalRecord,
        deps: &dyn Dependencies,
        ctx: &RunContext,
    ) -> Result<DependencyBundle> {
        let mut bundle = DependencyBundle::default();
        for (entity_type, local_id) in record.body.references() {
            match deps.ensure_remote(ctx, entity_type, local_id).await? {
                Some(remote_id) => bundle.insert(entity_type, local_id, remote_id),
                None => return Err(SyncError::dependency_not_ready(entity_type, local_id)),
            }
        }
        Ok(bundle)
    }

    /// Typed body to remote field bag. Sync fields are added by the driver.
    fn map_fields(&self, record: &LocalRecord, deps: &DependencyBundle) -> Result<Fields>;

    async fn locate_remote(
        &self,
        api: &dyn RemoteApi,
        record: &LocalRecord,
        policy: DuplicateKeyPolicy,
    ) -> Result<Option<ExternalId>> {
        let found = reconcile::locate_remote(api, record, self.business_key_field(), policy).await?;
        Ok(found.map(|Matched { key, value }| {
            tracing::debug!(?key, remote_id = %value, "remote counterpart located");
            value
        }))
    }

    async fn create_or_update_remote(
        &self,
        api: &dyn RemoteApi,
        remote_id: Option<&ExternalId>,
        payload: Fields,
    ) -> Result<ExternalId> {
        let entity_type = self.entity_type();
        match remote_id {
            Some(id) => {
                api.update(entity_type, id, payload).await?;
                Ok(id.clone())
            }
            None => api.add(entity_type, payload).await,
        }
    }
}

/// Counters of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub processed: usize,
    pub errors: usize,
    pub skipped: usize,
    /// Entries sent back for another attempt.
    pub retried: usize,
    /// Entries another worker locked first.
    pub contended: usize,
    /// Whether the run stopped early on request.
    pub stopped: bool,
}

impl DrainStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Processed => self.processed += 1,
            Outcome::Retry => self.retried += 1,
            Outcome::Error => self.errors += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

impl<S: LocalStore, A: RemoteApi> SyncEngine<S, A> {
    /// Drain claimable queue entries of `source` for the given types (all
    /// types when empty), oldest first.
    #[tracing::instrument(level = "debug", skip_all, fields(source = %source))]
    pub async fn drain_queue(
        &self,
        ctx: &RunContext,
        entity_types: &[EntityType],
        source: ChangeSource,
        limit: Option<usize>,
    ) -> Result<DrainStats> {
        let limit = limit.unwrap_or(self.config().batch_size);
        let batch = self.store().claim_batch(entity_types, source, limit).await?;
        let mut stats = DrainStats::default();

        for (i, entry) in batch.iter().enumerate() {
            if ctx.stop_requested() {
                tracing::info!(remaining = batch.len() - i, "stop requested, leaving queue");
                stats.stopped = true;
                break;
            }

            if !self.store().lock(entry.id, self.now()).await? {
                tracing::debug!(entry = %entry.id, "entry locked elsewhere");
                stats.contended += 1;
                continue;
            }

            let result = self.push_entry(ctx, entry).await;
            let outcome = self.supervisor().settle(self.store(), entry, result).await?;
            stats.record(outcome);

            let delay = self.config().call_delay;
            if !delay.is_zero() && i + 1 < batch.len() {
                tokio::time::sleep(delay).await;
            }
        }

        tracing::info!(
            claimed = batch.len(),
            processed = stats.processed,
            retried = stats.retried,
            skipped = stats.skipped,
            errors = stats.errors,
            "queue drained"
        );
        Ok(stats)
    }

    /// Push the record behind one locked queue entry.
    pub async fn push_entry(&self, ctx: &RunContext, entry: &ChangeQueueEntry) -> Result<()> {
        tracing::debug!(
            entry = %entry.id,
            entity_type = %entry.entity_type,
            local_id = %entry.local_id,
            attempt = entry.retry_count + 1,
            "pushing entry"
        );
        self.push_record(ctx, entry.entity_type, entry.local_id, Some(entry.id))
            .await
            .map(|_| ())
    }

    /// Push one local record and persist its remote identity.
    ///
    /// Nothing is written locally until the remote call succeeded; the
    /// identity write is a single transaction on the record and the entry.
    pub(crate) async fn push_record(
        &self,
        ctx: &RunContext,
        entity_type: EntityType,
        local_id: LocalId,
        entry: Option<EntryId>,
    ) -> Result<ExternalId> {
        if !ctx.begin_push(entity_type, local_id) {
            return Err(SyncError::dependency_not_ready(entity_type, local_id));
        }
        let result = self.push_record_inner(ctx, entity_type, local_id, entry).await;
        ctx.end_push(entity_type, local_id);
        result
    }

    async fn push_record_inner(
        &self,
        ctx: &RunContext,
        entity_type: EntityType,
        local_id: LocalId,
        entry: Option<EntryId>,
    ) -> Result<ExternalId> {
        let processor = self.registry().outbound(entity_type)?;

        let record = self
            .store()
            .find_by_id(entity_type, local_id)
            .await?
            .ok_or(ValidationError::NotFound {
                entity_type,
                id: local_id,
            })?;

        processor.validate(&record)?;
        let deps = processor.resolve_dependencies(&record, self, ctx).await?;

        let mut payload = processor.map_fields(&record, &deps)?;
        if let Some(gid) = &record.meta.global_id {
            payload.insert(fields::GLOBAL_ID.into(), json!(gid.as_str()));
        }
        payload.insert(fields::LAST_PUSHED.into(), json!(self.now()));

        let api: &dyn RemoteApi = self.api();
        let remote_id = processor
            .locate_remote(api, &record, self.config().duplicate_key_policy)
            .await?;
        let created = remote_id.is_none();
        let remote_id = processor
            .create_or_update_remote(api, remote_id.as_ref(), payload)
            .await?;
        let remote_modified_at = self.read_back_modified_at(entity_type, &remote_id).await;

        self.store()
            .link_remote(&RemoteLink {
                entry,
                entity_type,
                local_id,
                external_id: remote_id.clone(),
                global_id: None,
                remote_modified_at,
            })
            .await?;
        ctx.remember_remote_id(entity_type, local_id, remote_id.clone());

        tracing::debug!(
            %entity_type,
            %local_id,
            remote_id = %remote_id,
            created,
            "record pushed"
        );
        Ok(remote_id)
    }

    /// Modification time the remote side assigned to our write, so the
    /// next pull recognises it as already applied. `None` if unreadable.
    pub(crate) async fn read_back_modified_at(
        &self,
        entity_type: EntityType,
        remote_id: &ExternalId,
    ) -> Option<Timestamp> {
        match self.api().get(entity_type, remote_id).await {
            Ok(item) => item.map(|item| item.modified_at),
            Err(e) => {
                tracing::warn!(%entity_type, %remote_id, error = %e, "read-back after write failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_require() {
        let mut bundle = DependencyBundle::default();
        assert!(bundle.is_empty());
        bundle.insert(EntityType::Counterparty, LocalId(1), ExternalId::new("17"));

        assert_eq!(
            bundle.require(EntityType::Counterparty, LocalId(1)).unwrap(),
            &ExternalId::new("17")
        );
        assert!(matches!(
            bundle.require(EntityType::Organization, LocalId(1)),
            Err(SyncError::DependencyNotReady { .. })
        ));
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn test_stats_record() {
        let mut stats = DrainStats::default();
        stats.record(Outcome::Processed);
        stats.record(Outcome::Processed);
        stats.record(Outcome::Skipped);
        stats.record(Outcome::Error);
        assert_eq!((stats.processed, stats.skipped, stats.errors), (2, 1, 1));
    }
}
