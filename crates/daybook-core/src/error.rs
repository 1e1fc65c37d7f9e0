//! Sync error types

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// How a failed request should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient; the same request may succeed later
    Retryable,
    /// Retrying the same request will fail the same way
    Permanent,
    /// The credential was rejected
    ReauthRequired,
}

/// Errors raised by the sync core
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or HTTP client failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Payload could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server answered with a non-success status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalidation stream failure
    #[error("Event stream error: {0}")]
    Stream(String),

    /// Mutation arguments were rejected before anything was applied
    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    /// A mutation was issued before a credential made the client usable
    #[error("Sync client for '{domain}' is not initialized (no credential available)")]
    NotInitialized { domain: &'static str },

    /// The coordinator was shut down
    #[error("Sync coordinator has been shut down")]
    Closed,

    /// Missing or malformed credential
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Replica snapshot file failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify for the push retry policy
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => RetryClass::ReauthRequired,
                408 | 409 | 425 | 429 => RetryClass::Retryable,
                500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Http(e) if e.is_builder() => RetryClass::Permanent,
            Self::Http(_) | Self::Stream(_) => RetryClass::Retryable,
            Self::Auth(_) => RetryClass::ReauthRequired,
            Self::Json(_)
            | Self::InvalidMutation(_)
            | Self::NotInitialized { .. }
            | Self::Closed
            | Self::Storage(_) => RetryClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_class() == RetryClass::Retryable
    }
}
