use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use vitra_relay::{Relay, RelayConfig, RelayServer};

/// Vitra presence and broadcast relay.
#[derive(Parser, Debug)]
#[command(name = "vitra-server", about = "Vitra presence and broadcast relay")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind.
    #[arg(long, env = "PORT", default_value = "3002")]
    port: u16,

    /// Full bind address; overrides --host and --port.
    #[arg(long, env = "VITRA_BIND_ADDR")]
    bind: Option<String>,

    /// RocksDB directory for images and trails (in-memory if unset).
    #[arg(long, env = "VITRA_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// Backlog at which volatile broadcasts to a connection are dropped.
    #[arg(long, env = "VITRA_VOLATILE_LIMIT", default_value = "64")]
    volatile_limit: usize,

    /// Largest accepted WebSocket message in bytes.
    #[arg(long, default_value = "100000000")]
    max_message_size: usize,
}

impl Cli {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            bind_addr: self
                .bind
                .unwrap_or_else(|| format!("{}:{}", self.host, self.port)),
            volatile_queue_limit: self.volatile_limit,
            max_message_size: self.max_message_size,
            storage_path: self.storage_path,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Cli::parse().into_config();
    log::info!(
        "Starting relay on {} (volatile limit {}, storage {})",
        config.bind_addr,
        config.volatile_queue_limit,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
    );

    let relay = Arc::new(Relay::new(config)?);
    let server = RelayServer::from_relay(relay);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            server.relay().settle().await;
            let stats = server.stats().await;
            log::info!(
                "Shutting down: {} connection(s) served, {} reliable / {} volatile deliveries",
                stats.total_connections,
                stats.reliable_sent,
                stats.volatile_sent
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_custom_port() {
        let cli = Cli::parse_from(["vitra-server", "--host", "127.0.0.1", "--port", "4000"]);
        assert_eq!(cli.port, 4000);
        assert_eq!(cli.into_config().bind_addr.split(':').next(), Some("127.0.0.1"));
    }

    #[test]
    fn cli_bind_overrides_host_port() {
        let cli = Cli::parse_from(["vitra-server", "--bind", "127.0.0.1:9000", "--port", "4000"]);
        assert_eq!(cli.into_config().bind_addr, "127.0.0.1:9000");
    }

    #[test]
    fn cli_defaults_match_relay_defaults() {
        let config = Cli::parse_from(["vitra-server"]).into_config();
        let defaults = RelayConfig::default();
        assert_eq!(config.volatile_queue_limit, defaults.volatile_queue_limit);
        assert_eq!(config.max_message_size, defaults.max_message_size);
    }

    #[test]
    fn cli_storage_and_limits() {
        let cli = Cli::parse_from([
            "vitra-server",
            "--storage-path",
            "/tmp/vitra",
            "--volatile-limit",
            "8",
            "--max-message-size",
            "1024",
        ]);
        let config = cli.into_config();
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/vitra")));
        assert_eq!(config.volatile_queue_limit, 8);
        assert_eq!(config.max_message_size, 1024);
    }
}
