//! Crate-level error kinds.
//!
//! Layer errors (`ProtocolError`, `DocumentError`, `StoreError`) convert into
//! [`CollabError`], which is what the hub, the authority and the REST surface
//! report to their callers.

use thiserror::Error;

use crate::document::DocumentError;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invite has already been used")]
    AlreadyUsed,

    #[error("invite has expired")]
    Expired,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, CollabError>;

impl CollabError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::Persistence(e.to_string())
    }
}

impl From<DocumentError> for CollabError {
    fn from(e: DocumentError) -> Self {
        CollabError::Validation(e.to_string())
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed | ProtocolError::Timeout => {
                CollabError::Transport(e.to_string())
            }
            other => CollabError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_is_persistence_failure() {
        let err: CollabError = StoreError::DatabaseError("disk full".into()).into();
        assert!(matches!(err, CollabError::Persistence(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_protocol_error_mapping() {
        let closed: CollabError = ProtocolError::ConnectionClosed.into();
        assert!(matches!(closed, CollabError::Transport(_)));

        let garbage: CollabError = ProtocolError::DeserializationError("eof".into()).into();
        assert!(matches!(garbage, CollabError::Validation(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(CollabError::not_found("room").to_string(), "room not found");
        assert_eq!(CollabError::AlreadyUsed.to_string(), "invite has already been used");
    }
}
