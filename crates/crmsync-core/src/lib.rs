//! # crmsync core
//!
//! Pure types for the CRM mirror: identifiers from both sides, change queue
//! entries, typed entity bodies and their validation.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`EntityType`] - Discriminator naming a synchronized aggregate
//! - [`ChangeQueueEntry`] - One pending mutation, with its lock and retry state
//! - [`LocalRecord`] - A locally mastered record: [`SyncMeta`] + [`EntityBody`]
//! - [`LocalId`], [`ExternalId`], [`GlobalId`] - The three identities of a record
//!
//! ## Identity
//!
//! A record is known locally by its [`LocalId`], remotely by its
//! [`ExternalId`], and on both sides by its [`GlobalId`]. Pairing a local
//! record with its remote counterpart tries those keys in that order and
//! falls back to the domain business key (see [`EntityBody::business_key`]).

pub mod clock;
pub mod entity;
pub mod error;
pub mod queue;
pub mod types;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{
    Contract, Counterparty, CounterpartyKind, EntityBody, LocalRecord, Order, OrderLine,
    Organization, PaymentStatus, Product, ShipmentStatus, SyncMeta,
};
pub use error::{CoreError, ValidationError};
pub use queue::{ChangeQueueEntry, QueueSummary};
pub use types::{
    ChangeSource, ChangeStatus, EntityType, EntryId, ExternalId, GlobalId, LocalId, Timestamp,
};
pub use validation::{validate_body, validate_tax_id};
