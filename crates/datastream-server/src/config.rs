//! Configuration for the stream server

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use datastream_core::StreamType;
use datastream_storage::StoreConfig;

use crate::error::{ServerError, ServerResult};

/// Configuration for a StreamServer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP listener binds to
    pub listen_addr: SocketAddr,
    /// Entry store configuration
    pub store: StoreConfig,
    /// Per-subscriber commit notification buffer; a live session that falls
    /// further behind is dropped
    pub broadcast_capacity: usize,
    /// Entries read from the store per catch-up step
    pub catch_up_batch_size: usize,
    /// Packets buffered per connection before the session waits
    pub outgoing_queue_depth: usize,
    /// Socket write timeout in milliseconds
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 6900)),
            store: StoreConfig::default(),
            broadcast_capacity: 1024,
            catch_up_batch_size: 256,
            outgoing_queue_depth: 1024,
            write_timeout_ms: 10_000,
        }
    }
}

impl ServerConfig {
    /// Create a configuration with a custom stream file
    pub fn with_stream_file(path: impl Into<PathBuf>, stream_type: StreamType) -> Self {
        Self {
            store: StoreConfig::new(path, stream_type),
            ..Default::default()
        }
    }

    /// Load a configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(raw: &str) -> ServerResult<Self> {
        toml::from_str(raw).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Set the listen address
    pub fn with_listen_addr(mut self, listen_addr: SocketAddr) -> Self {
        self.listen_addr = listen_addr;
        self
    }

    /// Set the store configuration
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Set the broadcast buffer per subscriber
    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Set the catch-up batch size
    pub fn with_catch_up_batch_size(mut self, batch_size: usize) -> Self {
        self.catch_up_batch_size = batch_size;
        self
    }

    /// Set the per-connection outgoing queue depth
    pub fn with_outgoing_queue_depth(mut self, depth: usize) -> Self {
        self.outgoing_queue_depth = depth;
        self
    }

    /// Stream type served
    pub fn stream_type(&self) -> StreamType {
        self.store.stream_type
    }

    /// Socket write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> ServerResult<()> {
        if self.broadcast_capacity == 0 {
            return Err(ServerError::Config("broadcast_capacity must be > 0".into()));
        }
        if self.catch_up_batch_size == 0 {
            return Err(ServerError::Config("catch_up_batch_size must be > 0".into()));
        }
        if self.outgoing_queue_depth == 0 {
            return Err(ServerError::Config("outgoing_queue_depth must be > 0".into()));
        }
        if self.store.max_payload_size > u32::MAX as usize {
            return Err(ServerError::Config(
                "store.max_payload_size must fit in 32 bits".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr.port(), 6900);
    }

    #[test]
    fn test_from_toml() {
        let config = ServerConfig::from_toml_str(
            r#"
            listen_addr = "127.0.0.1:7000"
            broadcast_capacity = 16

            [store]
            path = "/tmp/sequencer.bin"
            stream_type = 2
            sync_on_write = false
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr.port(), 7000);
        assert_eq!(config.broadcast_capacity, 16);
        assert_eq!(config.stream_type(), StreamType(2));
        assert!(!config.store.sync_on_write);
        // Unset fields keep their defaults
        assert_eq!(config.catch_up_batch_size, 256);
    }

    #[test]
    fn test_invalid_toml() {
        let result = ServerConfig::from_toml_str("listen_addr = 5");
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = ServerConfig::default().with_broadcast_capacity(0);
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }
}
