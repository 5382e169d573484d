use async_trait::async_trait;
use serde_json::json;

use crmsync_core::{EntityBody, EntityType, LocalRecord, Product};

use super::set;
use crate::context::RunContext;
use crate::engine::EntityHandler;
use crate::error::{Result, SyncError};
use crate::inbound::InboundPuller;
use crate::outbound::{DependencyBundle, OutboundProcessor};
use crate::remote::{Fields, RemoteItem};
use crate::resolver::Dependencies;

const SKU: &str = "CODE";
const NAME: &str = "NAME";
const PRICE: &str = "PRICE";
const UNIT: &str = "MEASURE";

const DEFAULT_UNIT: &str = "pcs";

/// Catalogue items (`crm.product`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductSync;

impl EntityHandler for ProductSync {
    fn entity_type(&self) -> EntityType {
        EntityType::Product
    }

    fn business_key_field(&self) -> &'static str {
        SKU
    }
}

#[async_trait]
impl OutboundProcessor for ProductSync {
    fn map_fields(&self, record: &LocalRecord, _deps: &DependencyBundle) -> Result<Fields> {
        let EntityBody::Product(p) = &record.body else {
            return Err(SyncError::mapping("product handler got another entity"));
        };

        let mut payload = Fields::new();
        set(&mut payload, SKU, json!(p.sku.trim()));
        set(&mut payload, NAME, json!(p.name.trim()));
        set(&mut payload, PRICE, json!(p.price_cents));
        set(&mut payload, UNIT, json!(p.unit));
        Ok(payload)
    }
}

#[async_trait]
impl InboundPuller for ProductSync {
    async fn map_to_local(
        &self,
        item: &RemoteItem,
        _deps: &dyn Dependencies,
        _ctx: &RunContext,
    ) -> Result<EntityBody> {
        Ok(EntityBody::Product(Product {
            sku: item.require_text(SKU)?.to_string(),
            name: item.require_text(NAME)?.to_string(),
            price_cents: item.int(PRICE)?.unwrap_or(0),
            unit: item.text(UNIT).unwrap_or(DEFAULT_UNIT).to_string(),
        }))
    }
}
