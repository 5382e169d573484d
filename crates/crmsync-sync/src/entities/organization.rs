use async_trait::async_trait;
use serde_json::json;

use crmsync_core::{EntityBody, EntityType, LocalRecord, Organization};

use super::{opt_text, set};
use crate::context::RunContext;
use crate::engine::EntityHandler;
use crate::error::{Result, SyncError};
use crate::inbound::InboundPuller;
use crate::outbound::{DependencyBundle, OutboundProcessor};
use crate::remote::{Fields, RemoteItem};
use crate::resolver::Dependencies;

const TITLE: &str = "TITLE";
const INN: &str = "UF_INN";
const KPP: &str = "UF_KPP";

/// Our own legal entities (`crm.mycompany`).
#[derive(Debug, Clone, Copy, Default)]
pub struct OrganizationSync;

impl EntityHandler for OrganizationSync {
    fn entity_type(&self) -> EntityType {
        EntityType::Organization
    }

    fn business_key_field(&self) -> &'static str {
        INN
    }
}

#[async_trait]
impl OutboundProcessor for OrganizationSync {
    fn map_fields(&self, record: &LocalRecord, _deps: &DependencyBundle) -> Result<Fields> {
        let EntityBody::Organization(org) = &record.body else {
            return Err(SyncError::mapping("organization handler got another entity"));
        };

        let mut payload = Fields::new();
        set(&mut payload, TITLE, json!(org.name.trim()));
        set(&mut payload, INN, json!(org.tax_id.trim()));
        set(&mut payload, KPP, opt_text(&org.kpp));
        Ok(payload)
    }
}

#[async_trait]
impl InboundPuller for OrganizationSync {
    async fn map_to_local(
        &self,
        item: &RemoteItem,
        _deps: &dyn Dependencies,
        _ctx: &RunContext,
    ) -> Result<EntityBody> {
        Ok(EntityBody::Organization(Organization {
            name: item.require_text(TITLE)?.to_string(),
            tax_id: item.require_text(INN)?.to_string(),
            kpp: item.text(KPP).map(str::to_string),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_fields() {
        let record = LocalRecord::new(EntityBody::Organization(Organization {
            name: " Horns & Hooves ".into(),
            tax_id: "7707083893".into(),
            kpp: None,
        }));
        let payload = OrganizationSync
            .map_fields(&record, &DependencyBundle::default())
            .unwrap();
        assert_eq!(payload[TITLE], json!("Horns & Hooves"));
        assert_eq!(payload[INN], json!("7707083893"));
        assert!(payload[KPP].is_null());
    }
}
