//! Error types for the sync runtime.

use crate::config::ConfigError;
use nestlog_engine::wire::RemoteActivity;
use nestlog_engine::RecordId;
use thiserror::Error;

/// Failure of one call to the remote activities API.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    /// No attempt was possible
    #[error("remote unreachable: {0}")]
    Offline(String),

    /// The addressed remote record no longer exists
    #[error("remote record not found")]
    NotFound,

    /// The server holds a newer version; carries the server's copy
    #[error("version conflict: server is at version {}", .0.version)]
    VersionConflict(Box<RemoteActivity>),

    /// The payload was rejected; retrying will not help
    #[error("rejected by remote: {0}")]
    Validation(String),

    /// Timeouts, 5xx and other failures worth retrying
    #[error("transient remote failure: {0}")]
    Transient(String),
}

impl RemoteError {
    /// Whether an automatic retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// All errors surfaced by the sync runtime.
///
/// Network failures normally stay inside the record sync engine and show up
/// only as record status and events; store errors always propagate.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local store error: {0}")]
    Store(#[from] nestlog_engine::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("retries exhausted for {id} after {attempts} attempts")]
    RetriesExhausted { id: RecordId, attempts: u32 },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("sync service has been disposed")]
    Disposed,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
