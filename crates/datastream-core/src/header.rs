//! Stream header record

use bytes::{Buf, BufMut, BytesMut};

use crate::entry::StreamType;
use crate::error::ProtocolError;

/// Current stream format version
pub const FORMAT_VERSION: u8 = 1;

/// Encoded size of the header record
pub const HEADER_RECORD_SIZE: usize = 10;

/// Stream-wide metadata
///
/// `total_entries` only advances as the last step of a successful commit,
/// so a header snapshot never counts entries of an unfinished unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Number of committed entries
    pub total_entries: u64,
    /// Stream type fixed at creation
    pub stream_type: StreamType,
    /// Format version
    pub version: u8,
}

impl StreamHeader {
    /// Header of an empty stream
    pub fn new(stream_type: StreamType) -> Self {
        Self {
            total_entries: 0,
            stream_type,
            version: FORMAT_VERSION,
        }
    }

    /// Copy of this header with a different entry count
    pub fn with_total_entries(mut self, total_entries: u64) -> Self {
        self.total_entries = total_entries;
        self
    }

    /// Append the encoded record to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_RECORD_SIZE);
        buf.put_u64(self.total_entries);
        buf.put_u8(self.stream_type.value());
        buf.put_u8(self.version);
    }

    /// Encode into a fixed-size array
    pub fn to_bytes(&self) -> [u8; HEADER_RECORD_SIZE] {
        let mut out = [0u8; HEADER_RECORD_SIZE];
        out[..8].copy_from_slice(&self.total_entries.to_be_bytes());
        out[8] = self.stream_type.value();
        out[9] = self.version;
        out
    }

    /// Decode a header record from the front of `buf`
    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < HEADER_RECORD_SIZE {
            return Err(ProtocolError::Truncated("header record"));
        }
        Ok(Self {
            total_entries: buf.get_u64(),
            stream_type: StreamType(buf.get_u8()),
            version: buf.get_u8(),
        })
    }
}
