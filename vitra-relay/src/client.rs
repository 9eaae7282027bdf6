//! WebSocket client for the relay.
//!
//! Provides:
//! - Connection lifecycle with the `hello` handshake (the client learns its id)
//! - Typed helpers for every client command
//! - A stream of decoded server events
//!
//! ```text
//! RelayClient ── outgoing mpsc ──► writer task ──► WebSocket
//!      ▲                                              │
//!      └──────── event mpsc ◄──── reader task ◄───────┘
//! ```

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientEvent, ConnectionId, FollowAction, ProtocolError, ServerEvent};
use crate::storage::TrailSample;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct RelayClient {
    server_url: String,
    /// Assigned by the relay in `hello`
    id: Option<ConnectionId>,
    state: Arc<RwLock<ClientState>>,
    outgoing_tx: Option<mpsc::UnboundedSender<Message>>,
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
}

impl RelayClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            id: None,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            outgoing_tx: None,
            event_rx: None,
        }
    }

    /// Connect and wait for `hello`. Returns the relay-assigned id.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<ConnectionId, ProtocolError> {
        *self.state.write().await = ClientState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(ProtocolError::Handshake(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let id = match Self::read_hello(&mut ws_reader).await {
            Ok(id) => id,
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(e);
            }
        };

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode server events
        let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(1024);
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerEvent::decode(&data) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ClientState::Disconnected;
        });

        self.id = Some(id);
        self.outgoing_tx = Some(out_tx);
        self.event_rx = Some(event_rx);
        *self.state.write().await = ClientState::Connected;
        log::debug!("Connected to {} as {id}", self.server_url);
        Ok(id)
    }

    async fn read_hello<S>(reader: &mut S) -> Result<ConnectionId, ProtocolError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            match reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return match ServerEvent::decode(&data)? {
                        ServerEvent::Hello { connection_id } => Ok(connection_id),
                        other => Err(ProtocolError::Handshake(format!(
                            "expected hello, got {}",
                            other.name()
                        ))),
                    };
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Err(ProtocolError::ConnectionClosed);
                }
                Some(Ok(_)) => {}
            }
        }
    }

    /// Send a raw command.
    pub fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let encoded = event.encode()?;
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(Message::Binary(encoded.into()))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn join_room(&self, room_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::JoinRoom {
            room_id: room_id.into(),
        })
    }

    pub fn broadcast(&self, room_id: impl Into<String>, payload: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::ServerBroadcast {
            room_id: room_id.into(),
            payload,
        })
    }

    pub fn volatile_broadcast(
        &self,
        room_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::ServerVolatileBroadcast {
            room_id: room_id.into(),
            payload,
        })
    }

    pub fn follow(&self, followee: ConnectionId) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::UserFollow {
            followee,
            action: FollowAction::Follow,
        })
    }

    pub fn unfollow(&self, followee: ConnectionId) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::UserFollow {
            followee,
            action: FollowAction::Unfollow,
        })
    }

    pub fn upload_image(
        &self,
        data: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::UploadImage {
            data: data.into(),
            name: name.into(),
            mime_type: mime_type.into(),
        })
    }

    pub fn delete_image(&self, image_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::DeleteImage { image_id })
    }

    pub fn set_current_image(&self, image_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::SetCurrentImage { image_id })
    }

    pub fn send_trail(&self, file_name: impl Into<String>, sample: TrailSample) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::TrailData {
            file_name: file_name.into(),
            sample,
        })
    }

    /// Next server event, or `None` once the connection is gone (or the
    /// receiver was taken).
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.event_rx.as_mut()?.recv().await
    }

    /// Take the event receiver (can only be called once per connection).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Send a close frame and stop the writer.
    pub fn close(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None));
        }
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
