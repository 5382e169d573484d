//! Strong type definitions for crmsync.
//!
//! Identifiers from the two sides of the mirror are newtypes so a local row id
//! can never be handed to the remote API by mistake (or the other way round).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Unix time in milliseconds.
pub type Timestamp = i64;

/// Primary key of a record in the local system of record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(pub i64);

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalId({})", self.0)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Surrogate key of a change queue entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub i64);

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The remote system's own primary key for a record.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExternalId({})", self.0)
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier meaningful to both sides.
///
/// Minted by whichever side sees the record first; in practice by the inbound
/// pipeline when a remote record arrives without one. Always 32 lowercase hex
/// characters.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalId(String);

impl GlobalId {
    /// Mint a fresh random global id.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    /// Parse a global id, accepting upper-case hex as well.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let trimmed = s.trim();
        if trimmed.len() != 32 || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CoreError::MalformedGlobalId(s.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalId({})", &self.0[..8.min(self.0.len())])
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named class of synchronized business object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    /// One of our own legal entities.
    Organization,
    /// A customer or supplier company.
    Counterparty,
    /// A contract with a counterparty.
    Contract,
    /// A catalogue item.
    Product,
    /// A sales order with payment and shipment status.
    Order,
}

impl EntityType {
    /// All entity types, parents before dependents.
    pub const ALL: [EntityType; 5] = [
        EntityType::Organization,
        EntityType::Counterparty,
        EntityType::Product,
        EntityType::Contract,
        EntityType::Order,
    ];

    /// Stable storage code.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Organization => "organization",
            EntityType::Counterparty => "counterparty",
            EntityType::Contract => "contract",
            EntityType::Product => "product",
            EntityType::Order => "order",
        }
    }

    /// Resource prefix of the remote method family (`<resource>.list`, ...).
    pub fn remote_resource(&self) -> &'static str {
        match self {
            EntityType::Organization => "crm.mycompany",
            EntityType::Counterparty => "crm.company",
            EntityType::Contract => "crm.contract",
            EntityType::Product => "crm.product",
            EntityType::Order => "crm.deal",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEntityType(s.to_string()))
    }
}

/// Which side produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeSource {
    Local,
    Remote,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::Local => "LOCAL",
            ChangeSource::Remote => "REMOTE",
        }
    }
}

impl fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOCAL" => Ok(ChangeSource::Local),
            "REMOTE" => Ok(ChangeSource::Remote),
            _ => Err(CoreError::UnknownChangeSource(s.to_string())),
        }
    }
}

/// Lifecycle state of a change queue entry.
///
/// `pending -> processing -> {processed | retry | error | skipped}`; `retry`
/// entries are claimed again, the other outcomes are terminal until an
/// operator requeues them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeStatus {
    Pending,
    Processing,
    Retry,
    Error,
    Skipped,
    Processed,
}

impl ChangeStatus {
    pub const ALL: [ChangeStatus; 6] = [
        ChangeStatus::Pending,
        ChangeStatus::Processing,
        ChangeStatus::Retry,
        ChangeStatus::Error,
        ChangeStatus::Skipped,
        ChangeStatus::Processed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Processing => "processing",
            ChangeStatus::Retry => "retry",
            ChangeStatus::Error => "error",
            ChangeStatus::Skipped => "skipped",
            ChangeStatus::Processed => "processed",
        }
    }

    /// Whether a worker may claim an entry in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, ChangeStatus::Pending | ChangeStatus::Retry)
    }

    /// Whether the entry is finished until manually requeued.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChangeStatus::Error | ChangeStatus::Skipped | ChangeStatus::Processed
        )
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChangeStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| CoreError::UnknownChangeStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_roundtrip() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert!("invoice".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_status_classes() {
        assert!(ChangeStatus::Pending.is_claimable());
        assert!(ChangeStatus::Retry.is_claimable());
        assert!(!ChangeStatus::Processing.is_claimable());
        assert!(!ChangeStatus::Processing.is_terminal());
        assert!(ChangeStatus::Skipped.is_terminal());
        assert_eq!("processed".parse::<ChangeStatus>().unwrap(), ChangeStatus::Processed);
    }

    #[test]
    fn test_global_id_generate_and_parse() {
        let id = GlobalId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert_eq!(GlobalId::parse(id.as_str()).unwrap(), id);

        let upper = id.as_str().to_ascii_uppercase();
        assert_eq!(GlobalId::parse(&upper).unwrap(), id);

        assert!(GlobalId::parse("not-a-guid").is_err());
        assert_ne!(GlobalId::generate(), GlobalId::generate());
    }

    #[test]
    fn test_change_source_codes() {
        assert_eq!("LOCAL".parse::<ChangeSource>().unwrap(), ChangeSource::Local);
        assert_eq!(ChangeSource::Remote.to_string(), "REMOTE");
        assert!("local".parse::<ChangeSource>().is_err());
    }
}
