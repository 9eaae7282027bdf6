//! WebSocket transport for the relay.
//!
//! ```text
//! Client A ──┐                       ┌── Mailbox A ──► Client A
//!             ├── handle_connection ─┤
//! Client B ──┘     │                 └── Mailbox B ──► Client B
//!                  ▼
//!               Relay::handle ── rooms / follow graph / media store
//! ```
//!
//! Each connection task writes `hello` first, then multiplexes decoded
//! client frames into `Relay::handle` and drains its mailbox to the socket.
//! Whatever ends the task (close frame, transport error, failed write), the
//! disconnect cascade runs exactly once afterwards.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::config::RelayConfig;
use crate::protocol::{ClientEvent, ConnectionId, ServerEvent};
use crate::registry::Mailbox;
use crate::relay::{Relay, RelayStats};
use crate::storage::StoreError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct RelayServer {
    relay: Arc<Relay>,
}

impl RelayServer {
    /// Create a server, opening the configured media store.
    pub fn new(config: RelayConfig) -> Result<Self, StoreError> {
        Ok(Self::from_relay(Arc::new(Relay::new(config)?)))
    }

    pub fn from_relay(relay: Arc<Relay>) -> Self {
        Self { relay }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.relay.config().bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, relay).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<Relay>,
    ) -> Result<(), BoxError> {
        let ws_config =
            WebSocketConfig::default().max_message_size(Some(relay.config().max_message_size));
        let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;

        let (id, mailbox) = relay.connect().await;
        log::info!("WebSocket connection {id} established from {addr}");

        let result = Self::pump(ws_stream, addr, id, mailbox, &relay).await;
        relay.disconnect(id).await;
        result
    }

    /// Socket ⇄ relay loop for one connection.
    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        id: ConnectionId,
        mut mailbox: Mailbox,
        relay: &Relay,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let hello = ServerEvent::Hello { connection_id: id }.encode()?;
        ws_sender.send(Message::Binary(hello.into())).await?;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => match ClientEvent::decode(&data) {
                            Ok(event) => {
                                log::trace!("{id} sent {}", event.name());
                                // Rejections are logged and counted by the relay.
                                let _ = relay.handle(id, event).await;
                            }
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                            }
                        },

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {id} closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Text(_))) => {
                            log::warn!("Ignoring text frame from {addr}");
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                event = mailbox.recv() => {
                    let Some(event) = event else { break };
                    let encoded = event.encode()?;
                    ws_sender.send(Message::Binary(encoded.into())).await?;
                }
            }
        }

        Ok(())
    }

    pub async fn stats(&self) -> RelayStats {
        self.relay.stats().await
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryMediaStore;

    #[test]
    fn test_server_creation() {
        let server = RelayServer::new(RelayConfig::default()).unwrap();
        assert_eq!(server.relay().config().bind_addr, "0.0.0.0:3002");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let relay = Arc::new(Relay::with_store(
            RelayConfig::default(),
            Some(Arc::new(MemoryMediaStore::new())),
        ));
        let server = RelayServer::from_relay(relay);
        assert_eq!(server.stats().await, RelayStats::default());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = RelayConfig {
            storage_path: Some(dir.path().to_path_buf()),
            ..RelayConfig::default()
        };
        let server = RelayServer::new(config).unwrap();
        assert_eq!(
            server.relay().config().storage_path.as_deref(),
            Some(dir.path())
        );
    }
}
