//! Per entity type processors and pullers.
//!
//! Each handler knows the remote field names of one resource and converts
//! between its field bag and the typed [`EntityBody`](crmsync_core::EntityBody).
//! Links to other records travel as remote ids on the wire and as local ids
//! inside the engine.

mod contract;
mod counterparty;
mod order;
mod organization;
mod product;

pub use contract::ContractSync;
pub use counterparty::CounterpartySync;
pub use order::OrderSync;
pub use organization::OrganizationSync;
pub use product::ProductSync;

use serde_json::{json, Value};

use crmsync_core::{EntityType, ExternalId, LocalId, ValidationError};

use crate::context::RunContext;
use crate::error::{Result, SyncError};
use crate::remote::{Fields, RemoteItem};
use crate::resolver::Dependencies;

/// Resolve a mandatory remote link to a local id, importing the parent if
/// needed.
pub(crate) async fn require_link(
    item: &RemoteItem,
    field: &'static str,
    entity_type: EntityType,
    deps: &dyn Dependencies,
    ctx: &RunContext,
) -> Result<LocalId> {
    let remote_ref = item
        .reference(field)
        .ok_or(ValidationError::MissingField(field))?;
    link_to_local(&remote_ref, entity_type, deps, ctx).await
}

/// Resolve an optional remote link; a missing link is not an error, an
/// unresolvable one is.
pub(crate) async fn optional_link(
    item: &RemoteItem,
    field: &'static str,
    entity_type: EntityType,
    deps: &dyn Dependencies,
    ctx: &RunContext,
) -> Result<Option<LocalId>> {
    match item.reference(field) {
        Some(remote_ref) => Ok(Some(link_to_local(&remote_ref, entity_type, deps, ctx).await?)),
        None => Ok(None),
    }
}

async fn link_to_local(
    remote_ref: &ExternalId,
    entity_type: EntityType,
    deps: &dyn Dependencies,
    ctx: &RunContext,
) -> Result<LocalId> {
    deps.ensure_local(ctx, entity_type, remote_ref)
        .await?
        .ok_or_else(|| SyncError::dependency_not_ready(entity_type, remote_ref))
}

/// Optional text as a JSON value: `null` when absent.
pub(crate) fn opt_text(value: &Option<String>) -> Value {
    match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => json!(v),
        None => Value::Null,
    }
}

pub(crate) fn set(payload: &mut Fields, field: &str, value: Value) {
    payload.insert(field.to_string(), value);
}
