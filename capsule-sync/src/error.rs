//! Error types for the sync core
//!
//! Three families of failure exist:
//! - transient: network trouble, retried implicitly by poll loops
//! - terminal: the remote reported a failure, surfaced to the user verbatim
//! - local precondition: short-circuited before any network call

use thiserror::Error;

/// Result alias for sync core operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Sync core error type
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection, DNS or timeout failure
    #[error("Network error: {0}")]
    Network(String),

    /// Remote answered with a non-success HTTP status
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Credentials missing, rejected, or refresh failed
    #[error("Not authenticated")]
    Unauthorized,

    /// Response body did not match the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Another operation for the same resource is already running
    #[error("Busy: {0}")]
    Busy(String),

    /// Required configuration is missing
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// Remote reported `success: false` with this message
    #[error("{0}")]
    Remote(String),

    /// Operation was cancelled before it finished
    #[error("Cancelled")]
    Cancelled,

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// capsule-common error
    #[error("Common error: {0}")]
    Common(#[from] capsule_common::Error),
}

impl SyncError {
    /// Transient failures are retried by continuing the poll loop
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Local precondition failures never reach the network
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SyncError::Busy(_) | SyncError::NotConfigured(_) | SyncError::InvalidInput(_)
        )
    }

    /// Text suitable for a user-visible notice
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Remote(message) => message.clone(),
            SyncError::Api { message, .. } if !message.is_empty() => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}
