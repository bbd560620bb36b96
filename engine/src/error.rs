//! Error types for the nestlog engine.

use crate::{RecordId, SchemaVersion};
use thiserror::Error;

/// All possible errors from the nestlog engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("activity not found: {0}")]
    ActivityNotFound(RecordId),

    #[error("invalid activity: {0}")]
    InvalidActivity(String),

    #[error("invalid record {id}: {reason}")]
    InvalidRecord { id: RecordId, reason: String },

    // State errors
    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: RecordId,
        from: String,
        to: String,
    },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("unsupported schema version: {found} (max supported: {supported})")]
    UnsupportedSchema {
        found: SchemaVersion,
        supported: SchemaVersion,
    },

    // Persistence errors
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
