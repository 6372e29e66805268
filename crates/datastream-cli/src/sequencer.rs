//! Sequencer entry types
//!
//! A sequencer stream is a run of blocks, each committed as one unit:
//! an `L2BlockStart`, one or more `L2Transaction`s and an `L2BlockEnd`.
//! Payload fields are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use datastream_core::{
    DecodeError, DecodedFields, EntryDecoder, EntryDefinition, EntryType, EntryTypeRegistry,
    StreamType,
};

/// Stream type of the sequencer stream
pub const SEQUENCER_STREAM: StreamType = StreamType(1);

pub const L2_BLOCK_START: EntryType = EntryType(1);
pub const L2_TRANSACTION: EntryType = EntryType(2);
pub const L2_BLOCK_END: EntryType = EntryType(3);

/// Registry of the three sequencer entry types
pub fn registry() -> EntryTypeRegistry {
    EntryTypeRegistry::new()
        .with_entry(
            L2_BLOCK_START,
            EntryDefinition::new("L2BlockStart", SEQUENCER_STREAM).with_decoder(BlockStartDecoder),
        )
        .with_entry(
            L2_TRANSACTION,
            EntryDefinition::new("L2Transaction", SEQUENCER_STREAM)
                .with_decoder(TransactionDecoder),
        )
        .with_entry(
            L2_BLOCK_END,
            EntryDefinition::new("L2BlockEnd", SEQUENCER_STREAM).with_decoder(BlockEndDecoder),
        )
}

/// Opening record of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2BlockStart {
    pub batch_number: u64,
    pub block_number: u64,
    /// Unix seconds
    pub timestamp: u64,
    pub global_exit_root: [u8; 32],
    pub coinbase: [u8; 20],
    pub fork_id: u16,
}

impl L2BlockStart {
    pub const ENCODED_LEN: usize = 8 + 8 + 8 + 32 + 20 + 2;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u64(self.batch_number);
        buf.put_u64(self.block_number);
        buf.put_u64(self.timestamp);
        buf.put_slice(&self.global_exit_root);
        buf.put_slice(&self.coinbase);
        buf.put_u16(self.fork_id);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, DecodeError> {
        expect_len(payload, Self::ENCODED_LEN)?;
        let batch_number = payload.get_u64();
        let block_number = payload.get_u64();
        let timestamp = payload.get_u64();
        let mut global_exit_root = [0u8; 32];
        payload.copy_to_slice(&mut global_exit_root);
        let mut coinbase = [0u8; 20];
        payload.copy_to_slice(&mut coinbase);
        let fork_id = payload.get_u16();
        Ok(Self {
            batch_number,
            block_number,
            timestamp,
            global_exit_root,
            coinbase,
            fork_id,
        })
    }
}

/// One transaction inside a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2Transaction {
    pub effective_gas_price_percentage: u8,
    pub is_valid: bool,
    pub encoded: Bytes,
}

impl L2Transaction {
    const FIXED_LEN: usize = 1 + 1 + 4;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_LEN + self.encoded.len());
        buf.put_u8(self.effective_gas_price_percentage);
        buf.put_u8(u8::from(self.is_valid));
        buf.put_u32(self.encoded.len() as u32);
        buf.put_slice(&self.encoded);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < Self::FIXED_LEN {
            return Err(DecodeError::Length {
                expected: Self::FIXED_LEN,
                actual: payload.len(),
            });
        }
        let effective_gas_price_percentage = payload.get_u8();
        let is_valid = match payload.get_u8() {
            0 => false,
            1 => true,
            other => return Err(DecodeError::Malformed(format!("is_valid flag {other}"))),
        };
        let encoded_len = payload.get_u32() as usize;
        expect_len(payload, encoded_len)?;
        Ok(Self {
            effective_gas_price_percentage,
            is_valid,
            encoded: Bytes::copy_from_slice(payload),
        })
    }
}

/// Closing record of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2BlockEnd {
    pub block_hash: [u8; 32],
    pub state_root: [u8; 32],
}

impl L2BlockEnd {
    pub const ENCODED_LEN: usize = 32 + 32;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_slice(&self.block_hash);
        buf.put_slice(&self.state_root);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, DecodeError> {
        expect_len(payload, Self::ENCODED_LEN)?;
        let mut block_hash = [0u8; 32];
        payload.copy_to_slice(&mut block_hash);
        let mut state_root = [0u8; 32];
        payload.copy_to_slice(&mut state_root);
        Ok(Self {
            block_hash,
            state_root,
        })
    }
}

fn expect_len(payload: &[u8], expected: usize) -> Result<(), DecodeError> {
    if payload.len() != expected {
        return Err(DecodeError::Length {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn field(name: &str, value: impl ToString) -> (String, String) {
    (name.to_string(), value.to_string())
}

struct BlockStartDecoder;

impl EntryDecoder for BlockStartDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DecodedFields, DecodeError> {
        let block = L2BlockStart::decode(payload)?;
        Ok(vec![
            field("batch", block.batch_number),
            field("block", block.block_number),
            field("timestamp", block.timestamp),
            field("ger", hex::encode(block.global_exit_root)),
            field("coinbase", hex::encode(block.coinbase)),
            field("fork", block.fork_id),
        ])
    }
}

struct TransactionDecoder;

impl EntryDecoder for TransactionDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DecodedFields, DecodeError> {
        let tx = L2Transaction::decode(payload)?;
        Ok(vec![
            field("egp", tx.effective_gas_price_percentage),
            field("valid", tx.is_valid),
            field("encoded", hex::encode(&tx.encoded)),
        ])
    }
}

struct BlockEndDecoder;

impl EntryDecoder for BlockEndDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DecodedFields, DecodeError> {
        let end = L2BlockEnd::decode(payload)?;
        Ok(vec![
            field("hash", hex::encode(end.block_hash)),
            field("root", hex::encode(end.state_root)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datastream_core::Entry;

    fn block_start() -> L2BlockStart {
        L2BlockStart {
            batch_number: 101,
            block_number: 1337,
            timestamp: 1_700_000_000,
            global_exit_root: [0xab; 32],
            coinbase: [0x14; 20],
            fork_id: 5,
        }
    }

    #[test]
    fn test_block_start_layout() {
        let encoded = block_start().encode();
        assert_eq!(encoded.len(), L2BlockStart::ENCODED_LEN);
        assert_eq!(&encoded[..8], &101u64.to_be_bytes());
        assert_eq!(&encoded[76..], &5u16.to_be_bytes());
        assert_eq!(L2BlockStart::decode(&encoded).unwrap(), block_start());
    }

    #[test]
    fn test_transaction_length_checked() {
        let tx = L2Transaction {
            effective_gas_price_percentage: 128,
            is_valid: true,
            encoded: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };
        let encoded = tx.encode();
        assert_eq!(encoded.len(), 11);
        assert_eq!(L2Transaction::decode(&encoded).unwrap(), tx);

        let truncated = &encoded[..encoded.len() - 1];
        assert_eq!(
            L2Transaction::decode(truncated),
            Err(DecodeError::Length {
                expected: 5,
                actual: 4
            })
        );
    }

    #[test]
    fn test_transaction_rejects_bad_flag() {
        let payload = [128u8, 7, 0, 0, 0, 0];
        assert!(matches!(
            L2Transaction::decode(&payload),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_block_end_wrong_length() {
        assert!(L2BlockEnd::decode(&[0u8; 63]).is_err());
    }

    #[test]
    fn test_registry_describes_entries() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        for (_, definition) in registry.iter() {
            assert_eq!(definition.stream_type, SEQUENCER_STREAM);
        }

        let entry = Entry::new(0, L2_BLOCK_START, block_start().encode());
        let described = registry.describe(&entry).to_string();
        assert!(described.contains("L2BlockStart"));
        assert!(described.contains("block=1337"));
        assert!(described.contains("fork=5"));
    }
}
