//! Typed local entities.
//!
//! The remote side speaks in loose field bags; inside the engine every
//! record is one of the bodies below. Cross-entity links are always local
//! ids; turning them into remote ids is the pipelines' job.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::CoreError;
use crate::types::{EntityType, ExternalId, GlobalId, LocalId, Timestamp};

/// One of our own legal entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub tax_id: String,
    pub kpp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterpartyKind {
    LegalEntity,
    Individual,
}

/// A customer or supplier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    pub name: String,
    pub kind: CounterpartyKind,
    pub tax_id: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub number: String,
    pub counterparty: LocalId,
    pub organization: Option<LocalId>,
    /// ISO date (`YYYY-MM-DD`).
    pub signed_on: Option<String>,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Unpaid,
    PartiallyPaid,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShipmentStatus {
    Pending,
    PartiallyShipped,
    Shipped,
    Delivered,
    Returned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product: LocalId,
    pub quantity: i64,
    pub price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub number: String,
    pub counterparty: LocalId,
    pub contract: Option<LocalId>,
    pub total_cents: i64,
    pub payment_status: PaymentStatus,
    pub shipment_status: ShipmentStatus,
    pub lines: Vec<OrderLine>,
}

/// The typed body of a synchronized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityBody {
    Organization(Organization),
    Counterparty(Counterparty),
    Contract(Contract),
    Product(Product),
    Order(Order),
}

impl EntityBody {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityBody::Organization(_) => EntityType::Organization,
            EntityBody::Counterparty(_) => EntityType::Counterparty,
            EntityBody::Contract(_) => EntityType::Contract,
            EntityBody::Product(_) => EntityType::Product,
            EntityBody::Order(_) => EntityType::Order,
        }
    }

    /// The domain business key, used as the last-resort reconciliation key.
    pub fn business_key(&self) -> Option<&str> {
        let key = match self {
            EntityBody::Organization(o) => Some(o.tax_id.as_str()),
            EntityBody::Counterparty(c) => c.tax_id.as_deref(),
            EntityBody::Contract(c) => Some(c.number.as_str()),
            EntityBody::Product(p) => Some(p.sku.as_str()),
            EntityBody::Order(o) => Some(o.number.as_str()),
        };
        key.map(str::trim).filter(|k| !k.is_empty())
    }

    /// Cross-entity links this body depends on.
    pub fn references(&self) -> Vec<(EntityType, LocalId)> {
        match self {
            EntityBody::Organization(_) | EntityBody::Counterparty(_) | EntityBody::Product(_) => {
                Vec::new()
            }
            EntityBody::Contract(c) => {
                let mut refs = vec![(EntityType::Counterparty, c.counterparty)];
                if let Some(org) = c.organization {
                    refs.push((EntityType::Organization, org));
                }
                refs
            }
            EntityBody::Order(o) => {
                let mut refs = vec![(EntityType::Counterparty, o.counterparty)];
                if let Some(contract) = o.contract {
                    refs.push((EntityType::Contract, contract));
                }
                for line in &o.lines {
                    if !refs.contains(&(EntityType::Product, line.product)) {
                        refs.push((EntityType::Product, line.product));
                    }
                }
                refs
            }
        }
    }
}

/// Synchronization bookkeeping carried by every local record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Remote primary key, once linked.
    pub external_id: Option<ExternalId>,
    pub global_id: Option<GlobalId>,
    /// `remoteModifiedAt` of the last remote version applied locally.
    pub last_pulled_at: Option<Timestamp>,
    /// Soft-delete flag.
    pub deleted: bool,
    pub updated_at: Timestamp,
}

/// A locally mastered record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    /// `None` until the repository has saved it.
    pub id: Option<LocalId>,
    pub meta: SyncMeta,
    pub body: EntityBody,
}

impl LocalRecord {
    pub fn new(body: EntityBody) -> Self {
        Self {
            id: None,
            meta: SyncMeta::default(),
            body,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.body.entity_type()
    }

    pub fn business_key(&self) -> Option<&str> {
        self.body.business_key()
    }
}

macro_rules! string_codes {
    ($ty:ident, $field:literal, { $($variant:ident => $code:literal),+ $(,)? }) => {
        impl $ty {
            /// Wire code used by the remote side.
            pub fn code(&self) -> &'static str {
                match self {
                    $($ty::$variant => $code,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($code => Ok($ty::$variant),)+
                    _ => Err(CoreError::UnknownEnumValue {
                        field: $field,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

string_codes!(CounterpartyKind, "kind", {
    LegalEntity => "LEGAL",
    Individual => "PERSON",
});

string_codes!(PaymentStatus, "payment_status", {
    Unpaid => "UNPAID",
    PartiallyPaid => "PARTIAL",
    Paid => "PAID",
    Refunded => "REFUNDED",
});

string_codes!(ShipmentStatus, "shipment_status", {
    Pending => "PENDING",
    PartiallyShipped => "PARTIAL",
    Shipped => "SHIPPED",
    Delivered => "DELIVERED",
    Returned => "RETURNED",
});
