use async_trait::async_trait;
use serde_json::{json, Value};

use crmsync_core::{
    EntityBody, EntityType, ExternalId, LocalRecord, Order, OrderLine, PaymentStatus,
    ShipmentStatus,
};

use super::{optional_link, require_link, set};
use crate::context::RunContext;
use crate::engine::EntityHandler;
use crate::error::{Result, SyncError};
use crate::inbound::InboundPuller;
use crate::outbound::{DependencyBundle, OutboundProcessor};
use crate::remote::{value_to_i64, value_to_string, Fields, RemoteItem};
use crate::resolver::Dependencies;

const NUMBER: &str = "TITLE";
const COUNTERPARTY: &str = "COMPANY_ID";
const CONTRACT: &str = "UF_CONTRACT_ID";
const TOTAL: &str = "OPPORTUNITY";
const PAYMENT_STATUS: &str = "UF_PAYMENT_STATUS";
const SHIPMENT_STATUS: &str = "UF_SHIPMENT_STATUS";
const ROWS: &str = "PRODUCT_ROWS";
const ROW_PRODUCT: &str = "PRODUCT_ID";
const ROW_QUANTITY: &str = "QUANTITY";
const ROW_PRICE: &str = "PRICE";

/// Sales orders (`crm.deal`), with payment and shipment status and product
/// rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderSync;

impl EntityHandler for OrderSync {
    fn entity_type(&self) -> EntityType {
        EntityType::Order
    }

    fn business_key_field(&self) -> &'static str {
        NUMBER
    }
}

#[async_trait]
impl OutboundProcessor for OrderSync {
    fn map_fields(&self, record: &LocalRecord, deps: &DependencyBundle) -> Result<Fields> {
        let EntityBody::Order(o) = &record.body else {
            return Err(SyncError::mapping("order handler got another entity"));
        };

        let counterparty = deps.require(EntityType::Counterparty, o.counterparty)?;
        let contract = match o.contract {
            Some(id) => json!(deps.require(EntityType::Contract, id)?.as_str()),
            None => Value::Null,
        };
        let rows = o
            .lines
            .iter()
            .map(|line| {
                let product = deps.require(EntityType::Product, line.product)?;
                let mut row = Fields::new();
                set(&mut row, ROW_PRODUCT, json!(product.as_str()));
                set(&mut row, ROW_QUANTITY, json!(line.quantity));
                set(&mut row, ROW_PRICE, json!(line.price_cents));
                Ok(Value::Object(row))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut payload = Fields::new();
        set(&mut payload, NUMBER, json!(o.number.trim()));
        set(&mut payload, COUNTERPARTY, json!(counterparty.as_str()));
        set(&mut payload, CONTRACT, contract);
        set(&mut payload, TOTAL, json!(o.total_cents));
        set(&mut payload, PAYMENT_STATUS, json!(o.payment_status.code()));
        set(&mut payload, SHIPMENT_STATUS, json!(o.shipment_status.code()));
        set(&mut payload, ROWS, Value::Array(rows));
        Ok(payload)
    }
}

#[async_trait]
impl InboundPuller for OrderSync {
    async fn map_to_local(
        &self,
        item: &RemoteItem,
        deps: &dyn Dependencies,
        ctx: &RunContext,
    ) -> Result<EntityBody> {
        let counterparty =
            require_link(item, COUNTERPARTY, EntityType::Counterparty, deps, ctx).await?;
        let contract = optional_link(item, CONTRACT, EntityType::Contract, deps, ctx).await?;

        let payment_status = match item.text(PAYMENT_STATUS) {
            Some(code) => code.parse::<PaymentStatus>()?,
            None => PaymentStatus::Unpaid,
        };
        let shipment_status = match item.text(SHIPMENT_STATUS) {
            Some(code) => code.parse::<ShipmentStatus>()?,
            None => ShipmentStatus::Pending,
        };

        let mut lines = Vec::new();
        let rows = match item.fields.get(ROWS) {
            Some(Value::Array(rows)) => rows.as_slice(),
            None | Some(Value::Null) => &[],
            Some(other) => {
                return Err(SyncError::mapping(format!("{ROWS} is not an array: {other}")))
            }
        };
        for row in rows {
            let product_ref = row
                .get(ROW_PRODUCT)
                .and_then(value_to_string)
                .map(ExternalId)
                .ok_or_else(|| SyncError::mapping(format!("order row without {ROW_PRODUCT}")))?;
            let product = deps
                .ensure_local(ctx, EntityType::Product, &product_ref)
                .await?
                .ok_or_else(|| SyncError::dependency_not_ready(EntityType::Product, &product_ref))?;

            lines.push(OrderLine {
                product,
                quantity: row.get(ROW_QUANTITY).and_then(value_to_i64).unwrap_or(0),
                price_cents: row.get(ROW_PRICE).and_then(value_to_i64).unwrap_or(0),
            });
        }

        Ok(EntityBody::Order(Order {
            number: item.require_text(NUMBER)?.to_string(),
            counterparty,
            contract,
            total_cents: item.int(TOTAL)?.unwrap_or(0),
            payment_status,
            shipment_status,
            lines,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmsync_core::LocalId;

    #[test]
    fn test_map_fields_rows() {
        let record = LocalRecord::new(EntityBody::Order(Order {
            number: "SO-1".into(),
            counterparty: LocalId(1),
            contract: None,
            total_cents: 2_000,
            payment_status: PaymentStatus::PartiallyPaid,
            shipment_status: ShipmentStatus::Shipped,
            lines: vec![OrderLine { product: LocalId(5), quantity: 2, price_cents: 1_000 }],
        }));

        let mut deps = DependencyBundle::default();
        deps.insert(EntityType::Counterparty, LocalId(1), ExternalId::new("3"));
        deps.insert(EntityType::Product, LocalId(5), ExternalId::new("8"));

        let payload = OrderSync.map_fields(&record, &deps).unwrap();
        assert_eq!(payload[PAYMENT_STATUS], json!("PARTIAL"));
        assert_eq!(payload[SHIPMENT_STATUS], json!("SHIPPED"));
        assert_eq!(payload[ROWS][0][ROW_PRODUCT], json!("8"));
        assert_eq!(payload[ROWS][0][ROW_QUANTITY], json!(2));
    }
}
