//! # Datastream Storage
//!
//! Durable, append-only storage for stream entries.
//!
//! The [`EntryStore`] keeps every committed entry in a single stream file
//! and serves reads by entry number. Writes happen in two phases: entries
//! are first appended tentatively past the committed tail, then published
//! together by rewriting the header record. Readers only ever see entries
//! below the published count, so a unit of entries becomes visible all at
//! once or not at all.
//!
//! ## Storage Format
//!
//! ```text
//! [8 bytes: magic "DATSTRM\0"][10 bytes: header record][entry frame][entry frame]...
//! ```
//!
//! On open, bytes past the last committed entry (left behind by a crash
//! between the entry write and the header write) are truncated.
//!
//! ## Example
//!
//! ```rust,ignore
//! use datastream_core::{EntryType, StreamType};
//! use datastream_storage::{EntryStore, StoreConfig};
//!
//! let store = EntryStore::open(StoreConfig::new("stream.bin", StreamType(1))).await?;
//! store.append(EntryType(1), &payload).await?;
//! let header = store.commit_appended().await?;
//! let entry = store.read(0).await?;
//! ```

pub mod error;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use store::{EntryStore, FILE_HEADER_SIZE, FILE_MAGIC, StoreConfig};
