//! # Datastream Server
//!
//! The stream engine: a durable, strictly ordered, append-only log of typed
//! entries served to remote clients over TCP.
//!
//! This crate provides [`StreamServer`], which ties together:
//! - [`EntryStore`](datastream_storage::EntryStore): durable entry storage
//! - [`AtomicCommitManager`]: single-writer grouping of entries into units
//!   that become visible together or not at all
//! - [`Broadcaster`]: commit notifications fanned out to live sessions
//! - Client sessions: header queries, historical replay and live tail
//!
//! ## Example
//!
//! ```rust,ignore
//! use datastream_core::{EntryDefinition, EntryType, EntryTypeRegistry, StreamType};
//! use datastream_server::{ServerConfig, StreamServer};
//!
//! let registry = EntryTypeRegistry::new()
//!     .with_entry(EntryType(1), EntryDefinition::new("BlockStart", StreamType(1)));
//! let server = StreamServer::new(ServerConfig::default(), registry).await?;
//! server.start().await?;
//!
//! server.start_atomic_op().await?;
//! server.add_stream_entry(EntryType(1), b"block".to_vec()).await?;
//! server.commit_atomic_op().await?;
//! ```

mod atomic;
mod broadcaster;
mod config;
mod error;
mod server;
mod session;

pub use atomic::{AtomicCommitManager, AtomicOpStatus, ProvisionalEntry};
pub use broadcaster::{Broadcaster, CommittedRange, Subscription, SubscriptionError};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::StreamServer;
pub use session::{SessionInfo, SessionMode};
