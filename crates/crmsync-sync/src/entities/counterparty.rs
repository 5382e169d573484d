use async_trait::async_trait;
use serde_json::json;

use crmsync_core::{Counterparty, CounterpartyKind, EntityBody, EntityType, LocalRecord};

use super::{opt_text, set};
use crate::context::RunContext;
use crate::engine::EntityHandler;
use crate::error::{Result, SyncError};
use crate::inbound::InboundPuller;
use crate::outbound::{DependencyBundle, OutboundProcessor};
use crate::remote::{Fields, RemoteItem};
use crate::resolver::Dependencies;

const TITLE: &str = "TITLE";
const KIND: &str = "COMPANY_TYPE";
const INN: &str = "UF_INN";
const PHONE: &str = "PHONE";
const EMAIL: &str = "EMAIL";

/// Customers and suppliers (`crm.company`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterpartySync;

impl EntityHandler for CounterpartySync {
    fn entity_type(&self) -> EntityType {
        EntityType::Counterparty
    }

    fn business_key_field(&self) -> &'static str {
        INN
    }
}

#[async_trait]
impl OutboundProcessor for CounterpartySync {
    fn map_fields(&self, record: &LocalRecord, _deps: &DependencyBundle) -> Result<Fields> {
        let EntityBody::Counterparty(c) = &record.body else {
            return Err(SyncError::mapping("counterparty handler got another entity"));
        };

        let mut payload = Fields::new();
        set(&mut payload, TITLE, json!(c.name.trim()));
        set(&mut payload, KIND, json!(c.kind.code()));
        set(&mut payload, INN, opt_text(&c.tax_id));
        set(&mut payload, PHONE, opt_text(&c.phone));
        set(&mut payload, EMAIL, opt_text(&c.email));
        Ok(payload)
    }
}

#[async_trait]
impl InboundPuller for CounterpartySync {
    async fn map_to_local(
        &self,
        item: &RemoteItem,
        _deps: &dyn Dependencies,
        _ctx: &RunContext,
    ) -> Result<EntityBody> {
        let kind = match item.text(KIND) {
            Some(code) => code.parse::<CounterpartyKind>()?,
            None => CounterpartyKind::LegalEntity,
        };

        Ok(EntityBody::Counterparty(Counterparty {
            name: item.require_text(TITLE)?.to_string(),
            kind,
            tax_id: item.text(INN).map(str::to_string),
            phone: item.text(PHONE).map(str::to_string),
            email: item.text(EMAIL).map(str::to_string),
        }))
    }
}
