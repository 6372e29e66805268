//! Client configuration

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use datastream_core::{DEFAULT_MAX_PAYLOAD_SIZE, StreamType};

/// Configuration for a StreamClient
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address
    pub server_addr: SocketAddr,
    /// Stream type sent with every command
    pub stream_type: StreamType,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long a command waits for its result, in milliseconds
    pub command_timeout_ms: u64,
    /// Entries buffered between the receive loop and the consumer
    pub entry_buffer: usize,
    /// Largest entry payload accepted from the server
    pub max_payload_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 6900)),
            stream_type: StreamType(1),
            connect_timeout_ms: 5_000,
            command_timeout_ms: 10_000,
            entry_buffer: 1024,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for a server address and stream type
    pub fn new(server_addr: SocketAddr, stream_type: StreamType) -> Self {
        Self {
            server_addr,
            stream_type,
            ..Default::default()
        }
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the entry buffer size
    pub fn with_entry_buffer(mut self, entry_buffer: usize) -> Self {
        self.entry_buffer = entry_buffer;
        self
    }

    /// Set the payload limit
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let addr: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let config = ClientConfig::new(addr, StreamType(2))
            .with_connect_timeout(Duration::from_secs(1))
            .with_entry_buffer(8);

        assert_eq!(config.server_addr, addr);
        assert_eq!(config.stream_type, StreamType(2));
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
        assert_eq!(config.entry_buffer, 8);
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
    }
}
