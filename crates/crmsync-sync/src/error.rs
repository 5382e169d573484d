//! Error types for the sync module.
//!
//! Every pipeline step fails with one of these variants; the supervisor
//! decides the queue entry outcome by matching on the variant alone.

use thiserror::Error;

use crmsync_core::{CoreError, EntityType, ValidationError};
use crmsync_store::StoreError;

use crate::remote::RemoteApiError;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The record cannot be synchronized as it stands.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A required cross-entity link cannot be resolved remotely yet.
    #[error("dependency not ready: {entity_type} {reference}")]
    DependencyNotReady {
        entity_type: EntityType,
        reference: String,
    },

    /// The remote API call failed.
    #[error("remote api error: {0}")]
    RemoteApi(#[from] RemoteApiError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A remote payload could not be turned into a typed body.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse class of a [`SyncError`], for counters and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    DependencyNotReady,
    RemoteApi,
    Store,
    Mapping,
    Other,
}

impl SyncError {
    pub fn dependency_not_ready(entity_type: EntityType, reference: impl ToString) -> Self {
        Self::DependencyNotReady {
            entity_type,
            reference: reference.to_string(),
        }
    }

    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::DependencyNotReady { .. } => ErrorKind::DependencyNotReady,
            SyncError::RemoteApi(_) => ErrorKind::RemoteApi,
            SyncError::Store(_) => ErrorKind::Store,
            SyncError::Mapping(_) => ErrorKind::Mapping,
            SyncError::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// Validation and mapping failures depend only on the record itself;
    /// remote failures carry their own flag; everything else is assumed
    /// transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Validation(_) | SyncError::Mapping(_) => false,
            SyncError::RemoteApi(e) => e.retryable,
            SyncError::DependencyNotReady { .. } | SyncError::Store(_) | SyncError::Other(_) => {
                true
            }
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(e: CoreError) -> Self {
        SyncError::Mapping(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classes() {
        assert!(!SyncError::from(ValidationError::MissingField("name")).is_retryable());
        assert!(!SyncError::mapping("bad status").is_retryable());
        assert!(SyncError::dependency_not_ready(EntityType::Counterparty, "17").is_retryable());
        assert!(SyncError::from(anyhow::anyhow!("boom")).is_retryable());
        assert!(SyncError::from(RemoteApiError::from_status(503, "unavailable")).is_retryable());
        assert!(!SyncError::from(RemoteApiError::from_status(400, "bad field")).is_retryable());
    }

    #[test]
    fn test_core_errors_become_mapping_errors() {
        let err: SyncError = "LOST".parse::<crmsync_core::ShipmentStatus>().unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Mapping);
    }
}
