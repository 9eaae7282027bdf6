//! Relay configuration.

use std::path::PathBuf;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Undelivered events at which volatile sends to a connection are dropped
    pub volatile_queue_limit: usize,
    /// Largest accepted WebSocket message, in bytes
    pub max_message_size: usize,
    /// Media store path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3002".to_string(),
            volatile_queue_limit: 64,
            max_message_size: 100_000_000, // 100 MB, image uploads ride the socket
            storage_path: None,
        }
    }
}
