//! Error types for fieldsync.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::OwnerKind;

/// Result type alias using fieldsync's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Per-item rejection reasons raised while validating a capture source.
///
/// These never abort a batch; the capture pipeline records them as
/// rejections and continues with the next input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The source binary does not exist (capture buffer reclaimed, bad path).
    #[error("source binary missing: {0}")]
    Missing(PathBuf),

    /// The source path exists but is not a regular file.
    #[error("source is not a regular file: {0}")]
    NotAFile(PathBuf),

    /// The source is larger than the configured limit.
    #[error("source {path} is {size_bytes} bytes, limit is {max_bytes}")]
    Oversized {
        path: PathBuf,
        size_bytes: u64,
        max_bytes: u64,
    },

    /// The source is zero bytes long.
    #[error("source binary is empty: {0}")]
    Empty(PathBuf),

    /// The source content is not allowed (executables, blocked types).
    #[error("source {path} rejected: {reason}")]
    Blocked { path: PathBuf, reason: String },
}

/// Core error type for fieldsync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Owning schedule/invoice record does not exist
    #[error("Owner not found: {kind} {id}")]
    OwnerNotFound { kind: OwnerKind, id: String },

    /// Capture source failed validation
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A local transaction failed and was rolled back; nothing was saved.
    #[error("Transaction failed during {op}: {message}")]
    Transaction { op: &'static str, message: String },

    /// The remote-sync primitive failed as a whole
    #[error("Sync error: {0}")]
    Sync(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a store failure raised inside a capture/delete transaction.
    ///
    /// Validation and owner lookups pass through unchanged so callers can
    /// still tell a rejected input from a failed write.
    pub fn into_transaction(self, op: &'static str) -> Self {
        match self {
            Error::Transaction { .. }
            | Error::Validation(_)
            | Error::OwnerNotFound { .. }
            | Error::NotFound(_) => self,
            other => Error::Transaction {
                op,
                message: other.to_string(),
            },
        }
    }

    /// Transport-level failures that say nothing about the item being sent.
    ///
    /// The sync pass aborts on these instead of marking the item FAILED.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Request(_) | Error::Sync(_))
    }

    /// Errors that mean a local write did not happen and must be shown to
    /// the user immediately.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::Transaction { .. } | Error::OwnerNotFound { .. } | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
