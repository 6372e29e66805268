//! # Datastream Core
//!
//! Core types shared by the data stream server, its storage engine and its
//! clients.
//!
//! ## Key Types
//!
//! - [`Entry`]: One immutable, numbered, typed record of the stream
//! - [`StreamHeader`]: Stream metadata (total entries, stream type, version)
//! - [`EntryTypeRegistry`]: Maps entry type identifiers to names and decoders
//! - [`Command`] / [`Packet`]: Client requests and server responses on the wire
//!
//! ## Framing
//!
//! Entries use the same binary framing at rest and on the wire:
//! ```text
//! [8 bytes: entry number][2 bytes: entry type][4 bytes: length][length bytes: payload]
//! ```
//! The header record is:
//! ```text
//! [8 bytes: total entries][1 byte: stream type][1 byte: version]
//! ```
//! All integers are big-endian.

pub mod codec;
pub mod entry;
pub mod error;
pub mod header;
pub mod protocol;
pub mod registry;

// Re-export main types
pub use codec::{DEFAULT_MAX_PAYLOAD_SIZE, ENTRY_FRAME_HEADER_SIZE, read_entry_frame};
pub use entry::{Entry, EntryType, StreamType};
pub use error::{ProtocolError, ValidationError};
pub use header::{FORMAT_VERSION, HEADER_RECORD_SIZE, StreamHeader};
pub use protocol::{Command, CommandResult, Packet, ResultCode};
pub use registry::{
    DecodeError, DecodedFields, DescribedEntry, EntryDecoder, EntryDefinition,
    EntryTypeRegistry, OpaqueDecoder,
};
