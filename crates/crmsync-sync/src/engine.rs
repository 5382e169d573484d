//! The sync engine: store, remote API, clock and entity handlers wired
//! together.
//!
//! The pipelines live next to their traits ([`crate::outbound`],
//! [`crate::inbound`], [`crate::resolver`]) as further `impl` blocks on
//! [`SyncEngine`].

use std::collections::HashMap;
use std::sync::Arc;

use crmsync_core::{Clock, EntityType, Timestamp};
use crmsync_store::{LocalStore, StoreError};

use crate::config::SyncConfig;
use crate::entities;
use crate::error::{Result, SyncError};
use crate::inbound::InboundPuller;
use crate::outbound::OutboundProcessor;
use crate::remote::RemoteApi;
use crate::supervisor::{ReclaimReport, Supervisor};

/// Common ground of the per entity type processors and pullers.
pub trait EntityHandler: Send + Sync {
    fn entity_type(&self) -> EntityType;

    /// Remote field holding the business key, for last-resort matching.
    fn business_key_field(&self) -> &'static str;
}

/// Processors and pullers by entity type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    outbound: HashMap<EntityType, Arc<dyn OutboundProcessor>>,
    inbound: HashMap<EntityType, Arc<dyn InboundPuller>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for every built-in entity type.
    pub fn standard() -> Self {
        Self::new()
            .with(entities::OrganizationSync)
            .with(entities::CounterpartySync)
            .with(entities::ContractSync)
            .with(entities::ProductSync)
            .with(entities::OrderSync)
    }

    /// Register a handler for both directions.
    pub fn with<H>(self, handler: H) -> Self
    where
        H: OutboundProcessor + InboundPuller + 'static,
    {
        let handler = Arc::new(handler);
        self.with_outbound(handler.clone()).with_inbound(handler)
    }

    pub fn with_outbound(mut self, processor: Arc<dyn OutboundProcessor>) -> Self {
        self.outbound.insert(processor.entity_type(), processor);
        self
    }

    pub fn with_inbound(mut self, puller: Arc<dyn InboundPuller>) -> Self {
        self.inbound.insert(puller.entity_type(), puller);
        self
    }

    pub fn outbound(&self, entity_type: EntityType) -> Result<&Arc<dyn OutboundProcessor>> {
        self.outbound.get(&entity_type).ok_or_else(|| {
            SyncError::Other(anyhow::anyhow!(
                "no outbound processor registered for {entity_type}"
            ))
        })
    }

    pub fn inbound(&self, entity_type: EntityType) -> Result<&Arc<dyn InboundPuller>> {
        self.inbound.get(&entity_type).ok_or_else(|| {
            SyncError::Other(anyhow::anyhow!("no inbound puller registered for {entity_type}"))
        })
    }
}

/// Bidirectional sync engine.
pub struct SyncEngine<S: LocalStore, A: RemoteApi> {
    store: Arc<S>,
    api: Arc<A>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    registry: HandlerRegistry,
    supervisor: Supervisor,
}

impl<S: LocalStore, A: RemoteApi> SyncEngine<S, A> {
    /// Create an engine with the standard entity handlers.
    pub fn new(store: Arc<S>, api: Arc<A>, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        let supervisor = Supervisor::new(config.max_retries);
        Self {
            store,
            api,
            clock,
            config,
            registry: HandlerRegistry::standard(),
            supervisor,
        }
    }

    /// Replace the entity handlers.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }

    /// Release locks held longer than the configured timeout.
    pub async fn reclaim_stale_locks(&self) -> std::result::Result<ReclaimReport, StoreError> {
        self.supervisor
            .reclaim_stale_locks(
                self.store.as_ref(),
                self.now(),
                self.config.stale_lock_timeout_ms(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_all_types() {
        let registry = HandlerRegistry::standard();
        for entity_type in EntityType::ALL {
            assert_eq!(registry.outbound(entity_type).unwrap().entity_type(), entity_type);
            assert_eq!(registry.inbound(entity_type).unwrap().entity_type(), entity_type);
        }
        assert!(HandlerRegistry::new().outbound(EntityType::Order).is_err());
    }
}
