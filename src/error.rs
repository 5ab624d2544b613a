//! Error taxonomy for the contract, document and signature APIs.
//!
//! Audit-path failures are deliberately absent here: they live in
//! [`crate::audit::AuditError`] and never reach a primary-operation caller.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification used by callers (and the tool layer) to decide
/// how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    OwnershipMismatch,
    Conflict,
    TransientProvider,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::OwnershipMismatch => "ownership_mismatch",
            Self::Conflict => "conflict",
            Self::TransientProvider => "transient_provider",
            Self::Storage => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("document {document_id} does not belong to contract {contract_id}")]
    OwnershipMismatch { document_id: i64, contract_id: i64 },

    #[error("contract {0} is not deleted")]
    NotDeleted(i64),

    #[error("contract {0} is already deleted")]
    AlreadyDeleted(i64),

    #[error("contract {0} is deleted and must be restored first")]
    ContractDeleted(i64),

    #[error("envelope {0} is already completed")]
    AlreadyCompleted(String),

    #[error("signature provider failed to send: {0}")]
    SendFailed(String),

    #[error("signature provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("file error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidStatus(_) | Self::Validation(_) | Self::InvalidDocument(_) => {
                ErrorKind::Validation
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::OwnershipMismatch { .. } => ErrorKind::OwnershipMismatch,
            Self::NotDeleted(_)
            | Self::AlreadyDeleted(_)
            | Self::ContractDeleted(_)
            | Self::AlreadyCompleted(_) => ErrorKind::Conflict,
            Self::SendFailed(_) | Self::ProviderUnavailable(_) => ErrorKind::TransientProvider,
            Self::Storage(_) | Self::Io(_) => ErrorKind::Storage,
        }
    }

    /// Provider hiccups are worth retrying; nothing else is.
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::TransientProvider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(Error::InvalidStatus("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::not_found("contract", 7).kind(), ErrorKind::NotFound);
        assert_eq!(Error::NotDeleted(1).kind(), ErrorKind::Conflict);
        assert_eq!(Error::AlreadyCompleted("e".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            Error::OwnershipMismatch {
                document_id: 1,
                contract_id: 2
            }
            .kind(),
            ErrorKind::OwnershipMismatch
        );
    }

    #[test]
    fn test_only_provider_errors_retriable() {
        assert!(Error::SendFailed("timeout".into()).is_retriable());
        assert!(!Error::Validation("bad".into()).is_retriable());
        assert!(!Error::AlreadyCompleted("e".into()).is_retriable());
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("document", 42);
        assert_eq!(err.to_string(), "document not found: 42");
    }
}
