use std::time::Duration;

use thiserror::Error;

pub type MessagingResult<T> = Result<T, MessagingError>;

/// Errors surfaced by the messaging operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("no authenticated user")]
    Unauthenticated,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("message body is empty")]
    EmptyMessage,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("reply target {0} is not part of this conversation")]
    InvalidReply(String),

    #[error("message {0} not found")]
    NotFound(String),
}

/// Failures reported by a store or identity adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for MessagingError {
    fn from(e: StoreError) -> Self {
        MessagingError::StoreUnavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_maps_to_store_unavailable() {
        let err: MessagingError = StoreError::Timeout(Duration::from_millis(50)).into();
        match err {
            MessagingError::StoreUnavailable(msg) => assert!(msg.contains("timed out")),
            other => panic!("Expected StoreUnavailable, got {:?}", other),
        }
    }
}
