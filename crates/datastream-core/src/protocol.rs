//! Wire protocol between stream clients and the stream server
//!
//! ## Commands (client → server)
//!
//! ```text
//! [1 byte: opcode][1 byte: stream type][8 bytes: from entry, Start only]
//! ```
//!
//! ## Packets (server → client)
//!
//! ```text
//! 0x01 Header: [header record]
//! 0x02 Entry:  [entry frame]
//! 0xFF Result: [1 byte: code][2 bytes: message length][message]
//! ```
//!
//! `Header` answers with a `Result` followed by a `Header` packet. `Start`
//! answers with a `Result` followed by a continuous run of `Entry` packets
//! until `Stop` or disconnect.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, read_entry_frame};
use crate::entry::{Entry, StreamType};
use crate::error::ProtocolError;
use crate::header::{HEADER_RECORD_SIZE, StreamHeader};

const OP_START: u8 = 1;
const OP_STOP: u8 = 2;
const OP_HEADER: u8 = 3;

const PT_HEADER: u8 = 0x01;
const PT_ENTRY: u8 = 0x02;
const PT_RESULT: u8 = 0xff;

/// Client command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Replay from `from_entry`, then tail live commits
    Start {
        stream_type: StreamType,
        from_entry: u64,
    },
    /// End the streaming session
    Stop { stream_type: StreamType },
    /// Query the stream header
    Header { stream_type: StreamType },
}

impl Command {
    /// Wire opcode
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Start { .. } => OP_START,
            Command::Stop { .. } => OP_STOP,
            Command::Header { .. } => OP_HEADER,
        }
    }

    /// Stream type the client expects
    pub fn stream_type(&self) -> StreamType {
        match self {
            Command::Start { stream_type, .. }
            | Command::Stop { stream_type }
            | Command::Header { stream_type } => *stream_type,
        }
    }

    /// Encode the command
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u8(self.opcode());
        buf.put_u8(self.stream_type().value());
        if let Command::Start { from_entry, .. } = self {
            buf.put_u64(*from_entry);
        }
        buf.freeze()
    }

    /// Write the command to `writer`
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one command
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] when the peer closes
    /// the stream between commands.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let opcode = read_tag(reader).await?;
        let stream_type = StreamType(
            reader
                .read_u8()
                .await
                .map_err(|e| ProtocolError::from_read(e, "command stream type"))?,
        );
        match opcode {
            OP_START => {
                let from_entry = reader
                    .read_u64()
                    .await
                    .map_err(|e| ProtocolError::from_read(e, "start offset"))?;
                Ok(Command::Start {
                    stream_type,
                    from_entry,
                })
            }
            OP_STOP => Ok(Command::Stop { stream_type }),
            OP_HEADER => Ok(Command::Header { stream_type }),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start { from_entry, .. } => write!(f, "Start({from_entry})"),
            Command::Stop { .. } => write!(f, "Stop"),
            Command::Header { .. } => write!(f, "Header"),
        }
    }
}

/// Status code carried by a result packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    /// Start offset is past the end of the stream
    InvalidOffset = 1,
    /// Start received while a session is already streaming
    AlreadyStarted = 2,
    /// Command stream type differs from the server's
    StreamTypeMismatch = 3,
    /// Live session fell behind and was dropped; re-issue Start to resume
    SubscriberLagged = 4,
    /// Server-side failure while serving the command
    Internal = 255,
}

impl ResultCode {
    /// Whether this code reports success
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

impl TryFrom<u8> for ResultCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::InvalidOffset),
            2 => Ok(Self::AlreadyStarted),
            3 => Ok(Self::StreamTypeMismatch),
            4 => Ok(Self::SubscriberLagged),
            255 => Ok(Self::Internal),
            other => Err(ProtocolError::UnknownResultCode(other)),
        }
    }
}

/// Outcome of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub code: ResultCode,
    pub message: String,
}

impl CommandResult {
    /// Successful result
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            message: String::new(),
        }
    }

    /// Failed result with a message
    pub fn error(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Server packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Header(StreamHeader),
    Entry(Entry),
    Result(CommandResult),
}

impl Packet {
    /// Encode the packet
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        match self {
            Packet::Header(header) => {
                buf.reserve(1 + HEADER_RECORD_SIZE);
                buf.put_u8(PT_HEADER);
                header.encode(&mut buf);
            }
            Packet::Entry(entry) => {
                buf.put_u8(PT_ENTRY);
                codec::encode_entry(entry, &mut buf);
            }
            Packet::Result(result) => {
                let message = result.message.as_bytes();
                let len = u16::try_from(message.len())
                    .map_err(|_| ProtocolError::MessageTooLong(message.len()))?;
                buf.reserve(4 + message.len());
                buf.put_u8(PT_RESULT);
                buf.put_u8(result.code as u8);
                buf.put_u16(len);
                buf.put_slice(message);
            }
        }
        Ok(buf.freeze())
    }

    /// Write the packet to `writer`
    ///
    /// The writer is not flushed; callers batching entries flush once the
    /// outgoing queue drains.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()?).await?;
        Ok(())
    }

    /// Read one packet
    pub async fn read_from<R>(reader: &mut R, max_payload: usize) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        match read_tag(reader).await? {
            PT_HEADER => {
                let mut record = [0u8; HEADER_RECORD_SIZE];
                reader
                    .read_exact(&mut record)
                    .await
                    .map_err(|e| ProtocolError::from_read(e, "header record"))?;
                Ok(Packet::Header(StreamHeader::decode(&mut &record[..])?))
            }
            PT_ENTRY => Ok(Packet::Entry(read_entry_frame(reader, max_payload).await?)),
            PT_RESULT => {
                let code = ResultCode::try_from(
                    reader
                        .read_u8()
                        .await
                        .map_err(|e| ProtocolError::from_read(e, "result code"))?,
                )?;
                let len = reader
                    .read_u16()
                    .await
                    .map_err(|e| ProtocolError::from_read(e, "result length"))?;
                let mut message = vec![0u8; len as usize];
                reader
                    .read_exact(&mut message)
                    .await
                    .map_err(|e| ProtocolError::from_read(e, "result message"))?;
                Ok(Packet::Result(CommandResult {
                    code,
                    message: String::from_utf8_lossy(&message).into_owned(),
                }))
            }
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// Read the leading tag byte, distinguishing a clean close from truncation
async fn read_tag<R>(reader: &mut R) -> Result<u8, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    match reader.read(&mut tag).await? {
        0 => Err(ProtocolError::ConnectionClosed),
        _ => Ok(tag[0]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryType;

    #[test]
    fn test_start_command_layout() {
        let cmd = Command::Start {
            stream_type: StreamType(1),
            from_entry: 5,
        };
        let bytes = cmd.encode();
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[0], OP_START);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..], &5u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_command_read() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&Command::Header { stream_type: StreamType(2) }.encode());
        wire.extend_from_slice(
            &Command::Start {
                stream_type: StreamType(2),
                from_entry: 77,
            }
            .encode(),
        );
        wire.extend_from_slice(&Command::Stop { stream_type: StreamType(2) }.encode());
        let mut reader = &wire[..];

        assert_eq!(
            Command::read_from(&mut reader).await.unwrap(),
            Command::Header { stream_type: StreamType(2) }
        );
        assert_eq!(
            Command::read_from(&mut reader).await.unwrap(),
            Command::Start {
                stream_type: StreamType(2),
                from_entry: 77
            }
        );
        assert!(matches!(
            Command::read_from(&mut reader).await.unwrap(),
            Command::Stop { .. }
        ));
        assert!(matches!(
            Command::read_from(&mut reader).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_opcode() {
        let mut reader = &[0x09u8, 0x01][..];
        let result = Command::read_from(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::UnknownOpcode(0x09))));
    }

    #[tokio::test]
    async fn test_truncated_start() {
        let mut reader = &[OP_START, 0x01, 0x00, 0x00][..];
        let result = Command::read_from(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Truncated("start offset"))));
    }

    #[tokio::test]
    async fn test_packet_sequence() {
        let packets = vec![
            Packet::Result(CommandResult::ok()),
            Packet::Header(StreamHeader::new(StreamType(1)).with_total_entries(3)),
            Packet::Entry(Entry::new(0, EntryType(1), &b"A"[..])),
            Packet::Result(CommandResult::error(ResultCode::InvalidOffset, "too far")),
        ];
        let mut wire = Vec::new();
        for packet in &packets {
            packet.write_to(&mut wire).await.unwrap();
        }

        let mut reader = &wire[..];
        for expected in &packets {
            let packet = Packet::read_from(&mut reader, 1024).await.unwrap();
            assert_eq!(&packet, expected);
        }
    }

    #[tokio::test]
    async fn test_unknown_packet_type() {
        let mut reader = &[0x42u8][..];
        let result = Packet::read_from(&mut reader, 1024).await;
        assert!(matches!(result, Err(ProtocolError::UnknownPacketType(0x42))));
    }

    #[test]
    fn test_result_code_conversion() {
        assert_eq!(ResultCode::try_from(4).unwrap(), ResultCode::SubscriberLagged);
        assert!(ResultCode::try_from(200).is_err());
        assert!(ResultCode::Ok.is_ok());
        assert!(!ResultCode::Internal.is_ok());
    }
}
