use async_trait::async_trait;
use serde_json::{json, Value};

use crmsync_core::{Contract, EntityBody, EntityType, LocalRecord};

use super::{opt_text, optional_link, require_link, set};
use crate::context::RunContext;
use crate::engine::EntityHandler;
use crate::error::{Result, SyncError};
use crate::inbound::InboundPuller;
use crate::outbound::{DependencyBundle, OutboundProcessor};
use crate::remote::{Fields, RemoteItem};
use crate::resolver::Dependencies;

const NUMBER: &str = "NUMBER";
const COUNTERPARTY: &str = "COMPANY_ID";
const ORGANIZATION: &str = "MYCOMPANY_ID";
const SIGNED_ON: &str = "SIGNED_ON";
const AMOUNT: &str = "AMOUNT";

/// Contracts (`crm.contract`). Depend on a counterparty and optionally on
/// one of our organizations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractSync;

impl EntityHandler for ContractSync {
    fn entity_type(&self) -> EntityType {
        EntityType::Contract
    }

    fn business_key_field(&self) -> &'static str {
        NUMBER
    }
}

#[async_trait]
impl OutboundProcessor for ContractSync {
    fn map_fields(&self, record: &LocalRecord, deps: &DependencyBundle) -> Result<Fields> {
        let EntityBody::Contract(c) = &record.body else {
            return Err(SyncError::mapping("contract handler got another entity"));
        };

        let counterparty = deps.require(EntityType::Counterparty, c.counterparty)?;
        let organization = match c.organization {
            Some(id) => json!(deps.require(EntityType::Organization, id)?.as_str()),
            None => Value::Null,
        };

        let mut payload = Fields::new();
        set(&mut payload, NUMBER, json!(c.number.trim()));
        set(&mut payload, COUNTERPARTY, json!(counterparty.as_str()));
        set(&mut payload, ORGANIZATION, organization);
        set(&mut payload, SIGNED_ON, opt_text(&c.signed_on));
        set(&mut payload, AMOUNT, json!(c.amount_cents));
        Ok(payload)
    }
}

#[async_trait]
impl InboundPuller for ContractSync {
    async fn map_to_local(
        &self,
        item: &RemoteItem,
        deps: &dyn Dependencies,
        ctx: &RunContext,
    ) -> Result<EntityBody> {
        let counterparty =
            require_link(item, COUNTERPARTY, EntityType::Counterparty, deps, ctx).await?;
        let organization =
            optional_link(item, ORGANIZATION, EntityType::Organization, deps, ctx).await?;

        Ok(EntityBody::Contract(Contract {
            number: item.require_text(NUMBER)?.to_string(),
            counterparty,
            organization,
            signed_on: item.text(SIGNED_ON).map(str::to_string),
            amount_cents: item.int(AMOUNT)?.unwrap_or(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmsync_core::{ExternalId, LocalId};

    fn contract(organization: Option<LocalId>) -> LocalRecord {
        LocalRecord::new(EntityBody::Contract(Contract {
            number: "C-7".into(),
            counterparty: LocalId(1),
            organization,
            signed_on: Some("2024-03-01".into()),
            amount_cents: 150_000,
        }))
    }

    #[test]
    fn test_map_fields_uses_remote_ids() {
        let mut deps = DependencyBundle::default();
        deps.insert(EntityType::Counterparty, LocalId(1), ExternalId::new("40"));

        let payload = ContractSync.map_fields(&contract(None), &deps).unwrap();
        assert_eq!(payload[COUNTERPARTY], json!("40"));
        assert!(payload[ORGANIZATION].is_null());
        assert_eq!(payload[AMOUNT], json!(150_000));
    }

    #[test]
    fn test_map_fields_without_dependency_fails() {
        let deps = DependencyBundle::default();
        let err = ContractSync.map_fields(&contract(Some(LocalId(2))), &deps).unwrap_err();
        assert!(matches!(err, SyncError::DependencyNotReady { .. }));
    }
}
