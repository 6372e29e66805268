//! Error types shared across the data stream crates

use thiserror::Error;

use crate::entry::{EntryType, StreamType};

/// Requests rejected before any state is mutated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Replay requested past the end of the stream
    #[error("Invalid offset: from entry {from_entry} but stream has {total_entries} entries")]
    InvalidOffset { from_entry: u64, total_entries: u64 },

    /// Payload exceeds the configured maximum
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Entry type missing from the registry
    #[error("Unregistered entry type: {0}")]
    UnregisteredEntryType(EntryType),

    /// Command or stream file carries a different stream type
    #[error("Stream type mismatch: expected {expected}, got {actual}")]
    StreamTypeMismatch {
        expected: StreamType,
        actual: StreamType,
    },
}

/// Malformed frames, unknown opcodes and transport failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer closed the connection on a frame boundary
    #[error("Connection closed")]
    ConnectionClosed,

    /// Input ended in the middle of a frame
    #[error("Truncated frame: {0}")]
    Truncated(&'static str),

    #[error("Unknown command opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("Unknown result code: {0}")]
    UnknownResultCode(u8),

    /// Frame announces a payload larger than allowed
    #[error("Frame payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Result message does not fit its length prefix
    #[error("Result message too long: {0} bytes")]
    MessageTooLong(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Map an `UnexpectedEof` I/O error onto [`ProtocolError::Truncated`]
    pub(crate) fn from_read(err: std::io::Error, what: &'static str) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Truncated(what)
        } else {
            Self::Io(err)
        }
    }
}
