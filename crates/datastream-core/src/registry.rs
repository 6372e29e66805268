//! Entry type registry
//!
//! Maps entry type identifiers to a human-readable name and a decoder for
//! display. The registry is built once at startup and shared read-only by
//! the server (which rejects unregistered types) and by clients (which use
//! it to render received entries). Payload bytes are never rewritten by
//! decoding.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::entry::{Entry, EntryType, StreamType};
use crate::error::ValidationError;

/// Decoded payload as ordered `(field, value)` pairs
pub type DecodedFields = Vec<(String, String)>;

/// Failure to decode a payload into its registered shape
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Payload length {actual} does not match expected {expected}")]
    Length { expected: usize, actual: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// Statically known payload shape of one entry type
pub trait EntryDecoder: Send + Sync {
    /// Decode a payload into displayable fields
    fn decode(&self, payload: &[u8]) -> Result<DecodedFields, DecodeError>;
}

/// Fallback decoder rendering the payload as hex
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueDecoder;

impl EntryDecoder for OpaqueDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DecodedFields, DecodeError> {
        Ok(vec![("data".to_string(), hex::encode(payload))])
    }
}

/// Registration of one entry type
#[derive(Clone)]
pub struct EntryDefinition {
    /// Human-readable name
    pub name: String,
    /// Stream the type belongs to
    pub stream_type: StreamType,
    /// Payload decoder
    pub decoder: Arc<dyn EntryDecoder>,
}

impl EntryDefinition {
    /// Definition with an opaque (hex) decoder
    pub fn new(name: impl Into<String>, stream_type: StreamType) -> Self {
        Self {
            name: name.into(),
            stream_type,
            decoder: Arc::new(OpaqueDecoder),
        }
    }

    /// Replace the decoder
    pub fn with_decoder(mut self, decoder: impl EntryDecoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }
}

impl fmt::Debug for EntryDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryDefinition")
            .field("name", &self.name)
            .field("stream_type", &self.stream_type)
            .finish_non_exhaustive()
    }
}

/// Lookup table from entry type to definition
#[derive(Debug, Clone, Default)]
pub struct EntryTypeRegistry {
    definitions: BTreeMap<EntryType, EntryDefinition>,
}

impl EntryTypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a definition
    pub fn register(&mut self, entry_type: EntryType, definition: EntryDefinition) -> &mut Self {
        self.definitions.insert(entry_type, definition);
        self
    }

    /// Builder-style registration
    pub fn with_entry(mut self, entry_type: EntryType, definition: EntryDefinition) -> Self {
        self.register(entry_type, definition);
        self
    }

    /// Look up a definition
    pub fn get(&self, entry_type: EntryType) -> Option<&EntryDefinition> {
        self.definitions.get(&entry_type)
    }

    /// Whether the type is registered
    pub fn contains(&self, entry_type: EntryType) -> bool {
        self.definitions.contains_key(&entry_type)
    }

    /// Registered name of a type
    pub fn name_of(&self, entry_type: EntryType) -> Option<&str> {
        self.get(entry_type).map(|d| d.name.as_str())
    }

    /// Reject types missing from the registry
    pub fn validate(&self, entry_type: EntryType) -> Result<&EntryDefinition, ValidationError> {
        self.get(entry_type)
            .ok_or(ValidationError::UnregisteredEntryType(entry_type))
    }

    /// Render an entry against its registered shape
    pub fn describe<'a>(&'a self, entry: &'a Entry) -> DescribedEntry<'a> {
        let definition = self.get(entry.entry_type);
        let fields = match definition {
            Some(def) => def.decoder.decode(&entry.payload),
            None => OpaqueDecoder.decode(&entry.payload),
        };
        DescribedEntry {
            entry,
            name: definition.map(|d| d.name.as_str()),
            fields,
        }
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether no type is registered
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Iterate definitions in type order
    pub fn iter(&self) -> impl Iterator<Item = (EntryType, &EntryDefinition)> {
        self.definitions.iter().map(|(t, d)| (*t, d))
    }
}

/// An entry paired with its decoded representation
#[derive(Debug)]
pub struct DescribedEntry<'a> {
    pub entry: &'a Entry,
    /// Registered name, `None` for unknown types
    pub name: Option<&'a str>,
    pub fields: Result<DecodedFields, DecodeError>,
}

impl fmt::Display for DescribedEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}[{}] len={}",
            self.entry.number,
            self.name.unwrap_or("unknown"),
            self.entry.entry_type,
            self.entry.len()
        )?;
        match &self.fields {
            Ok(fields) => {
                for (name, value) in fields {
                    write!(f, " {name}={value}")?;
                }
                Ok(())
            }
            Err(e) => write!(f, " <{e}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CounterDecoder;

    impl EntryDecoder for CounterDecoder {
        fn decode(&self, payload: &[u8]) -> Result<DecodedFields, DecodeError> {
            let bytes: [u8; 8] = payload.try_into().map_err(|_| DecodeError::Length {
                expected: 8,
                actual: payload.len(),
            })?;
            Ok(vec![("count".into(), u64::from_be_bytes(bytes).to_string())])
        }
    }

    fn registry() -> EntryTypeRegistry {
        EntryTypeRegistry::new()
            .with_entry(EntryType(1), EntryDefinition::new("Blob", StreamType(1)))
            .with_entry(
                EntryType(2),
                EntryDefinition::new("Counter", StreamType(1)).with_decoder(CounterDecoder),
            )
    }

    #[test]
    fn test_validate() {
        let registry = registry();
        assert_eq!(registry.validate(EntryType(2)).unwrap().name, "Counter");
        assert_eq!(
            registry.validate(EntryType(9)).unwrap_err(),
            ValidationError::UnregisteredEntryType(EntryType(9))
        );
    }

    #[test]
    fn test_describe_with_decoder() {
        let registry = registry();
        let entry = Entry::new(4, EntryType(2), 7u64.to_be_bytes().to_vec());
        let described = registry.describe(&entry);
        assert_eq!(described.name, Some("Counter"));
        assert_eq!(described.to_string(), "#4 Counter[2] len=8 count=7");
    }

    #[test]
    fn test_describe_decode_failure() {
        let registry = registry();
        let entry = Entry::new(0, EntryType(2), &b"xyz"[..]);
        let described = registry.describe(&entry);
        assert!(matches!(described.fields, Err(DecodeError::Length { actual: 3, .. })));
    }

    #[test]
    fn test_describe_unknown_type_is_opaque() {
        let registry = registry();
        let entry = Entry::new(1, EntryType(40), &b"\x01\xff"[..]);
        assert_eq!(
            registry.describe(&entry).to_string(),
            "#1 unknown[40] len=2 data=01ff"
        );
    }

    #[test]
    fn test_iteration_order() {
        let registry = registry();
        let names: Vec<_> = registry.iter().map(|(_, d)| d.name.as_str()).collect();
        assert_eq!(names, vec!["Blob", "Counter"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.name_of(EntryType(1)), Some("Blob"));
    }
}
