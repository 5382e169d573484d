//! Run-scoped state.
//!
//! One [`RunContext`] lives for exactly one scheduler run and is passed to
//! every pipeline step. Caches never outlive it, so concurrent runs and tests
//! do not share state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crmsync_core::{EntityType, ExternalId, GlobalId, LocalId};

/// Cooperative cancellation flag, shared between a run and its caller.
///
/// Checked between entries and items, never mid-entry.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request so the signal can drive another run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A remote parent known to be present and fresh locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParent {
    pub local_id: LocalId,
    pub global_id: GlobalId,
}

/// Caches and guards for one run.
#[derive(Debug, Default)]
pub struct RunContext {
    /// Inbound dependency cache: remote parent -> local counterpart.
    parents: Mutex<HashMap<(EntityType, ExternalId), ResolvedParent>>,
    /// Outbound dependency cache: local record -> remote id.
    remote_ids: Mutex<HashMap<(EntityType, LocalId), ExternalId>>,
    /// Records being pushed right now; a second push of one is a cycle.
    pushing: Mutex<HashSet<(EntityType, LocalId)>>,
    /// Remote records being imported right now.
    importing: Mutex<HashSet<(EntityType, ExternalId)>>,
    stop: StopSignal,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop(stop: StopSignal) -> Self {
        Self {
            stop,
            ..Self::default()
        }
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_stop_requested()
    }

    pub fn cached_parent(
        &self,
        entity_type: EntityType,
        remote_ref: &ExternalId,
    ) -> Option<ResolvedParent> {
        guard(&self.parents)
            .get(&(entity_type, remote_ref.clone()))
            .cloned()
    }

    pub fn remember_parent(
        &self,
        entity_type: EntityType,
        remote_ref: ExternalId,
        parent: ResolvedParent,
    ) {
        guard(&self.parents).insert((entity_type, remote_ref), parent);
    }

    pub fn cached_remote_id(&self, entity_type: EntityType, local_id: LocalId) -> Option<ExternalId> {
        guard(&self.remote_ids).get(&(entity_type, local_id)).cloned()
    }

    pub fn remember_remote_id(&self, entity_type: EntityType, local_id: LocalId, id: ExternalId) {
        guard(&self.remote_ids).insert((entity_type, local_id), id);
    }

    /// Mark a push as started. `false` if it is already in progress.
    pub(crate) fn begin_push(&self, entity_type: EntityType, local_id: LocalId) -> bool {
        guard(&self.pushing).insert((entity_type, local_id))
    }

    pub(crate) fn end_push(&self, entity_type: EntityType, local_id: LocalId) {
        guard(&self.pushing).remove(&(entity_type, local_id));
    }

    /// Mark an import as started. `false` if it is already in progress.
    pub(crate) fn begin_import(&self, entity_type: EntityType, remote_id: &ExternalId) -> bool {
        guard(&self.importing).insert((entity_type, remote_id.clone()))
    }

    pub(crate) fn end_import(&self, entity_type: EntityType, remote_id: &ExternalId) {
        guard(&self.importing).remove(&(entity_type, remote_id.clone()));
    }

    /// Drop every cache entry. Guards and the stop signal are untouched.
    pub fn clear(&self) {
        guard(&self.parents).clear();
        guard(&self.remote_ids).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal_is_shared() {
        let signal = StopSignal::new();
        let ctx = RunContext::with_stop(signal.clone());
        assert!(!ctx.stop_requested());
        signal.request_stop();
        assert!(ctx.stop_requested());
        signal.reset();
        assert!(!ctx.stop_requested());
    }

    #[test]
    fn test_parent_cache() {
        let ctx = RunContext::new();
        let parent = ResolvedParent {
            local_id: LocalId(3),
            global_id: GlobalId::generate(),
        };
        let remote = ExternalId::new("17");
        assert!(ctx.cached_parent(EntityType::Counterparty, &remote).is_none());

        ctx.remember_parent(EntityType::Counterparty, remote.clone(), parent.clone());
        assert_eq!(ctx.cached_parent(EntityType::Counterparty, &remote), Some(parent));
        assert!(ctx.cached_parent(EntityType::Organization, &remote).is_none());

        ctx.clear();
        assert!(ctx.cached_parent(EntityType::Counterparty, &remote).is_none());
    }

    #[test]
    fn test_push_guard() {
        let ctx = RunContext::new();
        assert!(ctx.begin_push(EntityType::Order, LocalId(1)));
        assert!(!ctx.begin_push(EntityType::Order, LocalId(1)));
        ctx.end_push(EntityType::Order, LocalId(1));
        assert!(ctx.begin_push(EntityType::Order, LocalId(1)));
    }
}
