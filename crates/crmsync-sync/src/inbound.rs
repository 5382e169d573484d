//! Inbound pull pipeline (remote -> local).
//!
//! One [`InboundPuller`] per entity type. A pull fetches everything modified
//! remotely since the type's cursor, filters out the changes we made
//! ourselves, reconciles each item with its local counterpart, upserts it,
//! and enqueues a `REMOTE` change so downstream processing runs through the
//! same queue. Items fail independently; the cursor moves once the whole
//! batch has been attempted.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crmsync_core::{
    validate_body, ChangeSource, EntityBody, EntityType, ExternalId, GlobalId, LocalId,
    LocalRecord, Timestamp,
};
use crmsync_store::{LocalStore, RemoteLink};

use crate::config::CursorPolicy;
use crate::context::{ResolvedParent, RunContext};
use crate::engine::{EntityHandler, SyncEngine};
use crate::error::{Result, SyncError};
use crate::reconcile::{self, Matched};
use crate::remote::{fields, Fields, RemoteApi, RemoteEntities, RemoteItem};
use crate::resolver::Dependencies;

/// Per entity type pull logic.
///
/// Only [`map_to_local`](Self::map_to_local) is entity specific.
#[async_trait]
pub trait InboundPuller: EntityHandler {
    /// Remote records modified after `since`, oldest first, up to
    /// `max_pages` pages.
    async fn fetch_changed_items(
        &self,
        api: &dyn RemoteApi,
        since: Option<Timestamp>,
        max_pages: usize,
    ) -> Result<ChangedItems> {
        let entity_type = self.entity_type();
        let mut fetched = ChangedItems::default();
        let mut start = 0;

        for page_no in 0..max_pages.max(1) {
            let page = api.list_changed(entity_type, since, start).await?;
            fetched.items.extend(page.items);
            match page.next {
                Some(next) if page_no + 1 == max_pages.max(1) => {
                    tracing::debug!(%entity_type, next, "page budget exhausted");
                    fetched.truncated = true;
                }
                Some(next) => start = next,
                None => break,
            }
        }
        Ok(fetched)
    }

    fn extract_external_id(&self, item: &RemoteItem) -> ExternalId {
        item.external_id.clone()
    }

    /// `None` means the remote side has no global id yet.
    fn extract_global_id(&self, item: &RemoteItem) -> Option<GlobalId> {
        item.global_id.clone()
    }

    fn extract_remote_modified_at(&self, item: &RemoteItem) -> Timestamp {
        item.modified_at
    }

    fn extract_last_pushed_stamp(&self, item: &RemoteItem) -> Option<Timestamp> {
        item.last_pushed_at
    }

    /// Remote field bag to typed body. Links to other remote records are
    /// turned into local ids through `deps`.
    async fn map_to_local(
        &self,
        item: &RemoteItem,
        deps: &dyn Dependencies,
        ctx: &RunContext,
    ) -> Result<EntityBody>;
}

/// Result of [`InboundPuller::fetch_changed_items`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangedItems {
    pub items: Vec<RemoteItem>,
    /// More changes remained when the page budget ran out.
    pub truncated: bool,
}

/// Counters of one pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullStats {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub errors: usize,
    /// Cursor after the pull.
    pub cursor: Option<Timestamp>,
    /// Whether the pull stopped early on request.
    pub stopped: bool,
}

/// What happened to one remote item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Created,
    Updated,
    /// Filtered as our own write, or already applied.
    Skipped,
    Deleted,
}

impl PullStats {
    fn record(&mut self, outcome: ImportOutcome) {
        match outcome {
            ImportOutcome::Created => self.created += 1,
            ImportOutcome::Updated => self.updated += 1,
            ImportOutcome::Skipped => self.skipped += 1,
            ImportOutcome::Deleted => self.deleted += 1,
        }
    }
}

/// Whether a remote change was made by someone other than us.
///
/// We stamp `UF_LAST_PUSHED` on every write; a record modified no later
/// than that stamp (plus tolerance) only carries our own change.
pub fn is_foreign_change(
    last_pushed: Option<Timestamp>,
    modified_at: Timestamp,
    tolerance_ms: i64,
) -> bool {
    match last_pushed {
        None => true,
        Some(pushed) => pushed.saturating_add(tolerance_ms) < modified_at,
    }
}

impl<S: LocalStore, A: RemoteApi> SyncEngine<S, A> {
    /// Pull remote changes of one entity type.
    #[tracing::instrument(level = "debug", skip_all, fields(entity_type = %entity_type))]
    pub async fn pull(&self, ctx: &RunContext, entity_type: EntityType) -> Result<PullStats> {
        let puller = self.registry().inbound(entity_type)?.clone();
        let since = self.store().get_cursor(entity_type).await?;
        let ChangedItems { items, truncated } = puller
            .fetch_changed_items(self.api(), since, self.config().max_pull_pages)
            .await?;

        let mut stats = PullStats {
            total: items.len(),
            ..PullStats::default()
        };
        let mut batch_max: Option<Timestamp> = None;
        let mut contiguous_max: Option<Timestamp> = None;
        let mut first_failed: Option<Timestamp> = None;
        // Cursor has to stay below this: unseen rows may share the timestamp.
        let mut ceiling: Option<Timestamp> = None;

        for item in &items {
            let modified_at = puller.extract_remote_modified_at(item);
            if ctx.stop_requested() {
                tracing::info!("stop requested, leaving batch");
                stats.stopped = true;
                ceiling = Some(modified_at.saturating_sub(1));
                break;
            }

            match self.import_item(ctx, puller.as_ref(), item, false).await {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    tracing::warn!(
                        remote_id = %item.external_id,
                        error = %e,
                        "failed to import remote item"
                    );
                    stats.errors += 1;
                    first_failed = first_failed.or(Some(modified_at));
                }
            }

            batch_max = batch_max.max(Some(modified_at));
            if first_failed.is_none() {
                contiguous_max = contiguous_max.max(Some(modified_at));
            }
        }

        if truncated && !stats.stopped {
            ceiling = items
                .last()
                .map(|item| puller.extract_remote_modified_at(item).saturating_sub(1));
        }

        let target = match self.config().cursor_policy {
            CursorPolicy::BatchMax => batch_max,
            // Earlier successes sharing the failed item's timestamp must not
            // carry the cursor past it.
            CursorPolicy::ContiguousSuccess => match first_failed {
                Some(failed_at) => contiguous_max.map(|t| t.min(failed_at.saturating_sub(1))),
                None => contiguous_max,
            },
        };
        let target = match (target, ceiling) {
            (Some(t), Some(c)) => Some(t.min(c)),
            (target, _) => target,
        };
        if truncated && target.is_some() && target <= since {
            tracing::warn!(
                ?since,
                "page budget holds only equal timestamps; cursor cannot advance"
            );
        }
        stats.cursor = match target {
            Some(to) => Some(self.store().advance_cursor(entity_type, to).await?),
            None => since,
        };

        tracing::info!(
            total = stats.total,
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            deleted = stats.deleted,
            errors = stats.errors,
            cursor = ?stats.cursor,
            "pull finished"
        );
        Ok(stats)
    }

    /// Apply one remote item locally.
    ///
    /// `force` bypasses the freshness filter and the already-applied guard;
    /// the dependency resolver uses it for explicit need-it-now fetches.
    pub async fn import_item(
        &self,
        ctx: &RunContext,
        puller: &dyn InboundPuller,
        item: &RemoteItem,
        force: bool,
    ) -> Result<ImportOutcome> {
        let entity_type = puller.entity_type();
        let remote_id = puller.extract_external_id(item);
        let modified_at = puller.extract_remote_modified_at(item);

        if !force {
            let last_pushed = puller.extract_last_pushed_stamp(item);
            let tolerance = self.config().push_stamp_tolerance_ms();
            if !is_foreign_change(last_pushed, modified_at, tolerance) {
                tracing::debug!(%remote_id, modified_at, ?last_pushed, "own write, skipping");
                return Ok(ImportOutcome::Skipped);
            }
        }

        if item.deleted {
            return self.apply_remote_deletion(puller, item).await;
        }

        if !force {
            if let Some(local) = self.store().find_by_external_id(entity_type, &remote_id).await? {
                let applied = local.meta.last_pulled_at.is_some_and(|at| at >= modified_at);
                if applied && !local.meta.deleted {
                    tracing::debug!(%remote_id, modified_at, "already applied, skipping");
                    return Ok(ImportOutcome::Skipped);
                }
            }
        }

        if !ctx.begin_import(entity_type, &remote_id) {
            return Err(SyncError::dependency_not_ready(entity_type, &remote_id));
        }
        let result = self.upsert_item(ctx, puller, item).await;
        ctx.end_import(entity_type, &remote_id);
        result
    }

    async fn upsert_item(
        &self,
        ctx: &RunContext,
        puller: &dyn InboundPuller,
        item: &RemoteItem,
    ) -> Result<ImportOutcome> {
        let entity_type = puller.entity_type();
        let remote_id = puller.extract_external_id(item);
        let remote_gid = puller.extract_global_id(item);

        let body = puller.map_to_local(item, self, ctx).await?;
        validate_body(&body)?;

        let matched = reconcile::match_local(
            self.store(),
            entity_type,
            &remote_id,
            remote_gid.as_ref(),
            body.business_key(),
            self.config().duplicate_key_policy,
        )
        .await?;

        let mut record = match matched {
            Some(Matched { key, value }) => {
                tracing::debug!(%remote_id, ?key, local_id = ?value.id, "local counterpart matched");
                value
            }
            None => LocalRecord::new(body.clone()),
        };
        let created = record.id.is_none();

        // Remote global id wins; otherwise keep ours, otherwise mint one.
        // Either of the latter two has to be written back.
        let (global_id, write_back) = match (remote_gid, record.meta.global_id.take()) {
            (Some(remote), _) => (remote, false),
            (None, Some(local)) => (local, true),
            (None, None) => (GlobalId::generate(), true),
        };

        record.body = body;
        record.meta.external_id = Some(remote_id.clone());
        record.meta.global_id = Some(global_id.clone());
        record.meta.last_pulled_at = Some(puller.extract_remote_modified_at(item));
        record.meta.deleted = false;

        let (local_id, _) = self
            .store()
            .commit_upsert(&record, Some(ChangeSource::Remote))
            .await?;

        if write_back {
            self.write_back_global_id(entity_type, local_id, &remote_id, &global_id)
                .await;
        }

        ctx.remember_parent(
            entity_type,
            remote_id.clone(),
            ResolvedParent {
                local_id,
                global_id,
            },
        );

        tracing::debug!(%entity_type, %remote_id, %local_id, created, "remote item applied");
        Ok(if created {
            ImportOutcome::Created
        } else {
            ImportOutcome::Updated
        })
    }

    async fn apply_remote_deletion(
        &self,
        puller: &dyn InboundPuller,
        item: &RemoteItem,
    ) -> Result<ImportOutcome> {
        let entity_type = puller.entity_type();
        let remote_id = puller.extract_external_id(item);

        let local = match self.store().find_by_external_id(entity_type, &remote_id).await? {
            Some(local) => Some(local),
            None => match puller.extract_global_id(item) {
                Some(gid) => self.store().find_by_global_id(entity_type, &gid).await?,
                None => None,
            },
        };

        match local {
            Some(LocalRecord {
                id: Some(local_id),
                meta,
                ..
            }) if !meta.deleted => {
                self.store().soft_delete(entity_type, local_id).await?;
                tracing::debug!(%entity_type, %remote_id, %local_id, "remote deletion applied");
                Ok(ImportOutcome::Deleted)
            }
            _ => Ok(ImportOutcome::Skipped),
        }
    }

    /// Store a global id on the remote record. Best effort: the identity is
    /// already durable locally and the next push carries it anyway.
    async fn write_back_global_id(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        remote_id: &ExternalId,
        global_id: &GlobalId,
    ) {
        let mut patch = Fields::new();
        patch.insert(fields::GLOBAL_ID.into(), json!(global_id.as_str()));
        patch.insert(fields::LAST_PUSHED.into(), json!(self.now()));

        if let Err(e) = self.api().update(entity_type, remote_id, patch).await {
            tracing::warn!(
                %entity_type,
                %remote_id,
                error = %e,
                "global id write-back failed"
            );
            return;
        }

        let Some(remote_modified_at) = self.read_back_modified_at(entity_type, remote_id).await
        else {
            return;
        };
        let link = RemoteLink {
            entry: None,
            entity_type,
            local_id,
            external_id: remote_id.clone(),
            global_id: None,
            remote_modified_at: Some(remote_modified_at),
        };
        if let Err(e) = self.store().link_remote(&link).await {
            tracing::warn!(%entity_type, %remote_id, error = %e, "recording write-back time failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_freshness_filter() {
        // Never pushed: always foreign
        assert!(is_foreign_change(None, 100, 0));
        // Our push is the latest change
        assert!(!is_foreign_change(Some(100), 100, 0));
        assert!(!is_foreign_change(Some(100), 99, 0));
        // Someone edited after our push
        assert!(is_foreign_change(Some(100), 101, 0));
        // Within tolerance
        assert!(!is_foreign_change(Some(100), 101, 5));
        assert!(is_foreign_change(Some(100), 106, 5));
    }

    #[test]
    fn test_stats_record() {
        let mut stats = PullStats::default();
        stats.record(ImportOutcome::Created);
        stats.record(ImportOutcome::Skipped);
        stats.record(ImportOutcome::Deleted);
        assert_eq!((stats.created, stats.skipped, stats.deleted), (1, 1, 1));
    }

    proptest! {
        #[test]
        fn own_writes_are_never_foreign(pushed in 0i64..1_000_000, lag in 0i64..1_000, tol in 0i64..1_000) {
            // The remote stamps its modification no later than our push plus tolerance
            let modified = pushed + lag.min(tol);
            prop_assert!(!is_foreign_change(Some(pushed), modified, tol));
        }
    }
}
