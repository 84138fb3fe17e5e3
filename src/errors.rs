//! Error types surfaced by the sharding core.
//!
//! [`ShardError`] is what the HTTP-facing layer sees.  Every variant maps
//! to a stable error code and an HTTP status so a front end can render it
//! without inspecting the message text.

use http::StatusCode;
use thiserror::Error;

use crate::storage::backend::StoreError;

/// Errors returned by the namespace directory, listing engine and blob
/// operations.
#[derive(Debug, Error)]
pub enum ShardError {
    /// No active namespace record exists for the blob.
    #[error("The specified blob does not exist: {container}/{blob}")]
    NotFound { container: String, blob: String },

    /// A compare-and-swap write lost every retry to concurrent writers.
    #[error("Concurrent updates to {container}/{blob} did not settle after {attempts} attempts")]
    Conflict {
        container: String,
        blob: String,
        attempts: u32,
    },

    /// A backing account failed or could not be reached.
    #[error("Backend account {account} is unavailable: {source}")]
    BackendUnavailable {
        account: String,
        #[source]
        source: StoreError,
    },

    /// The request carried an invalid marker or option combination.
    #[error("{message}")]
    Malformed { message: String },

    /// Catch-all for invariant violations and unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ShardError {
    pub(crate) fn backend(account: &str, source: StoreError) -> Self {
        ShardError::BackendUnavailable {
            account: account.to_string(),
            source,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        ShardError::Malformed {
            message: message.into(),
        }
    }

    /// Return the stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ShardError::NotFound { .. } => "BlobNotFound",
            ShardError::Conflict { .. } => "ConcurrentUpdateConflict",
            ShardError::BackendUnavailable { .. } => "ServerBusy",
            ShardError::Malformed { .. } => "InvalidQueryParameterValue",
            ShardError::Internal(_) => "InternalError",
        }
    }

    /// Return the HTTP status the front end should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ShardError::NotFound { .. } => StatusCode::NOT_FOUND,
            ShardError::Conflict { .. } => StatusCode::CONFLICT,
            ShardError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ShardError::Malformed { .. } => StatusCode::BAD_REQUEST,
            ShardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
