//! Dependency resolution.
//!
//! Ensures a prerequisite record is synchronized before a dependent one is
//! pushed or pulled. Resolution is lazy and synchronous: it runs inside the
//! pipeline step that needs it, and its results are cached in the
//! [`RunContext`] for the rest of the run.

use async_trait::async_trait;

use crmsync_core::{EntityType, ExternalId, GlobalId, LocalId};
use crmsync_store::LocalStore;

use crate::context::{ResolvedParent, RunContext};
use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::remote::{RemoteApi, RemoteEntities};

/// What pipeline steps may ask of the resolver.
#[async_trait]
pub trait Dependencies: Send + Sync {
    /// Make sure the remote record `remote_ref` exists locally and is at
    /// least as fresh as its remote version; return its global id.
    ///
    /// `None` means the record does not exist remotely.
    async fn ensure(
        &self,
        ctx: &RunContext,
        entity_type: EntityType,
        remote_ref: &ExternalId,
    ) -> Result<Option<GlobalId>>;

    /// Like [`ensure`](Self::ensure), returning the local id.
    async fn ensure_local(
        &self,
        ctx: &RunContext,
        entity_type: EntityType,
        remote_ref: &ExternalId,
    ) -> Result<Option<LocalId>>;

    /// Make sure the local record exists remotely; return its remote id.
    ///
    /// `None` means it could not be obtained in this run.
    async fn ensure_remote(
        &self,
        ctx: &RunContext,
        entity_type: EntityType,
        local_id: LocalId,
    ) -> Result<Option<ExternalId>>;
}

impl<S: LocalStore, A: RemoteApi> SyncEngine<S, A> {
    async fn resolve_parent(
        &self,
        ctx: &RunContext,
        entity_type: EntityType,
        remote_ref: &ExternalId,
    ) -> Result<Option<ResolvedParent>> {
        if let Some(hit) = ctx.cached_parent(entity_type, remote_ref) {
            return Ok(Some(hit));
        }

        let Some(item) = self.api().get(entity_type, remote_ref).await? else {
            tracing::debug!(%entity_type, %remote_ref, "parent not found remotely");
            return Ok(None);
        };
        if item.deleted {
            tracing::debug!(%entity_type, %remote_ref, "parent deleted remotely");
            return Ok(None);
        }

        let local = self.store().find_by_external_id(entity_type, remote_ref).await?;
        let fresh = local.as_ref().and_then(|record| {
            let current = !record.meta.deleted
                && record
                    .meta
                    .last_pulled_at
                    .is_some_and(|at| at >= item.modified_at);
            match (current, record.id, &record.meta.global_id) {
                (true, Some(local_id), Some(global_id)) => Some(ResolvedParent {
                    local_id,
                    global_id: global_id.clone(),
                }),
                _ => None,
            }
        });

        let resolved = match fresh {
            Some(parent) => parent,
            None => {
                tracing::debug!(
                    %entity_type,
                    %remote_ref,
                    remote_modified_at = item.modified_at,
                    local_pulled_at = ?local.as_ref().and_then(|r| r.meta.last_pulled_at),
                    "parent missing or stale locally, forcing import"
                );
                let puller = self.registry().inbound(entity_type)?.clone();
                self.import_item(ctx, puller.as_ref(), &item, true).await?;

                let record = self
                    .store()
                    .find_by_external_id(entity_type, remote_ref)
                    .await?
                    .ok_or_else(|| SyncError::dependency_not_ready(entity_type, remote_ref))?;
                match (record.id, record.meta.global_id) {
                    (Some(local_id), Some(global_id)) => ResolvedParent {
                        local_id,
                        global_id,
                    },
                    _ => return Err(SyncError::dependency_not_ready(entity_type, remote_ref)),
                }
            }
        };

        ctx.remember_parent(entity_type, remote_ref.clone(), resolved.clone());
        Ok(Some(resolved))
    }
}

#[async_trait]
impl<S: LocalStore, A: RemoteApi> Dependencies for SyncEngine<S, A> {
    async fn ensure(
        &self,
        ctx: &RunContext,
        entity_type: EntityType,
        remote_ref: &ExternalId,
    ) -> Result<Option<GlobalId>> {
        Ok(self
            .resolve_parent(ctx, entity_type, remote_ref)
            .await?
            .map(|p| p.global_id))
    }

    async fn ensure_local(
        &self,
        ctx: &RunContext,
        entity_type: EntityType,
        remote_ref: &ExternalId,
    ) -> Result<Option<LocalId>> {
        Ok(self
            .resolve_parent(ctx, entity_type, remote_ref)
            .await?
            .map(|p| p.local_id))
    }

    async fn ensure_remote(
        &self,
        ctx: &RunContext,
        entity_type: EntityType,
        local_id: LocalId,
    ) -> Result<Option<ExternalId>> {
        if let Some(remote_id) = ctx.cached_remote_id(entity_type, local_id) {
            return Ok(Some(remote_id));
        }

        let Some(record) = self.store().find_by_id(entity_type, local_id).await? else {
            return Ok(None);
        };
        if let Some(remote_id) = record.meta.external_id {
            ctx.remember_remote_id(entity_type, local_id, remote_id.clone());
            return Ok(Some(remote_id));
        }

        tracing::debug!(%entity_type, %local_id, "parent has no remote id, pushing it first");
        match self.push_record(ctx, entity_type, local_id, None).await {
            Ok(remote_id) => Ok(Some(remote_id)),
            Err(e) => {
                tracing::warn!(%entity_type, %local_id, error = %e, "parent push failed");
                Ok(None)
            }
        }
    }
}
