//! Binary entry framing
//!
//! The same frame is used in the stream file and on the wire:
//! ```text
//! [8 bytes: entry number][2 bytes: entry type][4 bytes: length][length bytes: payload]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::entry::{Entry, EntryType};
use crate::error::ProtocolError;

/// Size of the fixed part of an entry frame
pub const ENTRY_FRAME_HEADER_SIZE: usize = 14;

/// Default maximum payload size (1 MB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Total encoded size of a frame carrying `payload_len` bytes
pub fn entry_frame_len(payload_len: usize) -> usize {
    ENTRY_FRAME_HEADER_SIZE + payload_len
}

/// Append the frame for `entry` to `buf`
pub fn encode_entry(entry: &Entry, buf: &mut BytesMut) {
    encode_entry_parts(entry.number, entry.entry_type, &entry.payload, buf);
}

/// Append a frame built from its parts to `buf`
pub fn encode_entry_parts(number: u64, entry_type: EntryType, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(entry_frame_len(payload.len()));
    buf.put_u64(number);
    buf.put_u16(entry_type.value());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Decode one complete frame from the front of `buf`
pub fn decode_entry(buf: &mut Bytes, max_payload: usize) -> Result<Entry, ProtocolError> {
    if buf.remaining() < ENTRY_FRAME_HEADER_SIZE {
        return Err(ProtocolError::Truncated("entry frame header"));
    }
    let number = buf.get_u64();
    let entry_type = EntryType(buf.get_u16());
    let len = buf.get_u32() as usize;
    if len > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: max_payload,
        });
    }
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated("entry payload"));
    }
    let payload = buf.split_to(len);
    Ok(Entry {
        number,
        entry_type,
        payload,
    })
}

/// Read one frame from an async reader
///
/// The length field is checked against `max_payload` before the payload is
/// allocated.
pub async fn read_entry_frame<R>(reader: &mut R, max_payload: usize) -> Result<Entry, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; ENTRY_FRAME_HEADER_SIZE];
    reader
        .read_exact(&mut head)
        .await
        .map_err(|e| ProtocolError::from_read(e, "entry frame header"))?;

    let mut fields = &head[..];
    let number = fields.get_u64();
    let entry_type = EntryType(fields.get_u16());
    let len = fields.get_u32() as usize;

    if len > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| ProtocolError::from_read(e, "entry payload"))?;

    Ok(Entry {
        number,
        entry_type,
        payload: Bytes::from(payload),
    })
}
