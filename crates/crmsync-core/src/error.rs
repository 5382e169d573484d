//! Error types for crmsync core.

use thiserror::Error;

use crate::types::{EntityType, LocalId};

/// Errors raised while parsing or converting core values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("unknown change source: {0}")]
    UnknownChangeSource(String),

    #[error("unknown change status: {0}")]
    UnknownChangeStatus(String),

    #[error("malformed global id: {0}")]
    MalformedGlobalId(String),

    #[error("unknown {field} value: {value}")]
    UnknownEnumValue { field: &'static str, value: String },
}

/// Validation errors: the record can never be synchronized as it stands.
///
/// These are terminal for a queue entry. Retrying will not help until someone
/// edits the record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: EntityType, id: LocalId },

    #[error("missing mandatory field `{0}`")]
    MissingField(&'static str),

    #[error("malformed tax id {0:?}")]
    MalformedTaxId(String),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("{entity_type} {id} is deleted")]
    Deleted { entity_type: EntityType, id: LocalId },

    #[error("ambiguous business key {key:?}: {candidates} candidates")]
    AmbiguousBusinessKey { key: String, candidates: usize },
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::UnknownEnumValue { field, value } => ValidationError::InvalidValue {
                field,
                reason: format!("unknown value {value:?}"),
            },
            CoreError::MalformedGlobalId(id) => ValidationError::InvalidValue {
                field: "global_id",
                reason: format!("malformed {id:?}"),
            },
            other => ValidationError::InvalidValue {
                field: "value",
                reason: other.to_string(),
            },
        }
    }
}
