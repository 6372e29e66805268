//! Error types for the stream server

use thiserror::Error;

use datastream_core::{ProtocolError, ValidationError};
use datastream_storage::StorageError;

/// Errors that can occur in the stream server
///
/// State and validation errors are returned before anything is mutated.
/// `CommitFailed` means the pending unit was rolled back before the error
/// was reported; the engine itself stays usable.
#[derive(Debug, Error)]
pub enum ServerError {
    /// StartAtomicOp while a unit is already open
    #[error("Atomic operation already open")]
    AlreadyOpen,

    /// Add/Commit/Rollback without an open unit
    #[error("No open atomic operation")]
    NoOpenUnit,

    /// Request rejected by validation
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Store could not persist the unit; nothing became visible
    #[error("Commit failed: {0}")]
    CommitFailed(#[source] StorageError),

    /// Read of an uncommitted entry number
    #[error("Entry not found: {0}")]
    NotFound(u64),

    /// Storage error outside a commit
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Malformed client traffic
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Server already listening
    #[error("Server already started")]
    AlreadyStarted,

    /// Server shut down
    #[error("Server shut down")]
    ShutDown,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entry_number, .. } => ServerError::NotFound(entry_number),
            StorageError::PayloadTooLarge { len, max } => {
                ServerError::Validation(ValidationError::PayloadTooLarge { len, max })
            }
            other => ServerError::Storage(other),
        }
    }
}

impl ServerError {
    /// Whether the error came from a caller bug in the atomic op sequence
    pub fn is_state_error(&self) -> bool {
        matches!(self, ServerError::AlreadyOpen | ServerError::NoOpenUnit)
    }
}

/// Result type alias for server operations
pub type ServerResult<T> = Result<T, ServerError>;
