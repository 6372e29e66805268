//! # Datastream Client
//!
//! Connects to a data stream server, queries its header and streams entries
//! from any offset, first the stored history and then new commits as they
//! happen.
//!
//! ## Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use datastream_client::{ClientConfig, StreamClient};
//! use datastream_core::EntryTypeRegistry;
//!
//! let client = StreamClient::connect(ClientConfig::default(), EntryTypeRegistry::new()).await?;
//! let header = client.header().await?;
//!
//! let mut entries = client.start(header.total_entries.saturating_sub(10)).await?;
//! while let Some(entry) = entries.next().await {
//!     let entry = entry?;
//!     println!("{}", client.registry().describe(&entry));
//! }
//! client.stop().await?;
//! ```

mod client;
mod config;
mod error;
mod stream;

pub use client::StreamClient;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use stream::EntryStream;
