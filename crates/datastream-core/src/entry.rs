//! Stream entries and their identifiers

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Caller-defined entry type identifier
///
/// The engine never interprets payloads; the type tag is only checked
/// against the [`EntryTypeRegistry`](crate::EntryTypeRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryType(pub u16);

impl EntryType {
    /// Create a new entry type
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the raw identifier
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for EntryType {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// Stream type identifier, fixed when the stream is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamType(pub u8);

impl StreamType {
    /// Create a new stream type
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Get the raw identifier
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for StreamType {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// A single committed entry of the stream
///
/// Entries are immutable once committed: their number, type and payload
/// never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Global sequence number, dense and starting at 0
    pub number: u64,
    /// Caller-defined type tag
    pub entry_type: EntryType,
    /// Opaque payload bytes
    pub payload: Bytes,
}

impl Entry {
    /// Create a new entry
    pub fn new(number: u64, entry_type: EntryType, payload: impl Into<Bytes>) -> Self {
        Self {
            number,
            entry_type,
            payload: payload.into(),
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
