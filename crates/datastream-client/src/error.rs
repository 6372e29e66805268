//! Error types for the stream client

use thiserror::Error;

use datastream_core::{ProtocolError, ResultCode};

/// Errors returned by StreamClient and its entry stream
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the server in time
    #[error("Connect to {0} timed out")]
    ConnectTimeout(std::net::SocketAddr),

    /// Server did not answer a command in time
    #[error("Command timed out")]
    Timeout,

    /// Server answered a command with an error code
    #[error("Rejected ({code:?}): {message}")]
    Rejected { code: ResultCode, message: String },

    /// Server sent something the command did not expect
    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(&'static str),

    /// Start while entries are already streaming
    #[error("Already streaming")]
    AlreadyStreaming,

    /// Server dropped the session for falling behind
    #[error("Subscriber lagged; resume from entry {resume_from}")]
    Lagged { resume_from: u64 },

    /// Entry numbers skipped or repeated
    #[error("Out of order entry: expected {expected}, got {found}")]
    OutOfOrder { expected: u64, found: u64 },

    /// Connection is closed or was stopped
    #[error("Connection closed")]
    Closed,

    /// Wire error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether reconnecting and restarting from the last seen entry can recover
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            ClientError::Lagged { .. }
                | ClientError::Closed
                | ClientError::Timeout
                | ClientError::Io(_)
                | ClientError::Protocol(ProtocolError::ConnectionClosed)
        )
    }
}

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;
