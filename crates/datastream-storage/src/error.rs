//! Error types for datastream-storage

use thiserror::Error;

use datastream_core::{ProtocolError, StreamType};

/// Errors that can occur in entry store operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error during storage operations
    #[error("I/O error: {0}")]
    Io(String),

    /// Requested entry has not been committed
    #[error("Entry not found: {entry_number} (total entries {total_entries})")]
    NotFound { entry_number: u64, total_entries: u64 },

    /// File does not start with the stream magic
    #[error("Invalid stream file magic")]
    InvalidMagic,

    /// File was created for another stream type
    #[error("Stream type mismatch: file has {found}, expected {expected}")]
    StreamTypeMismatch {
        expected: StreamType,
        found: StreamType,
    },

    /// File uses an unknown format version
    #[error("Unsupported stream format version: {0}")]
    UnsupportedVersion(u8),

    /// Committed data is missing or inconsistent
    #[error("Corrupted stream file: {0}")]
    Corrupted(String),

    /// Append exceeds the configured payload limit
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<ProtocolError> for StorageError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => StorageError::Io(e.to_string()),
            other => StorageError::Corrupted(other.to_string()),
        }
    }
}

impl StorageError {
    /// Create a new Corrupted error
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Whether the error is a read past the committed tail
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
