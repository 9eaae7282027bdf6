//! The relay: one shared instance wiring registry, rooms, presence, follow
//! graph, broadcast and media store together.
//!
//! ```text
//! ClientEvent ──► Relay::handle
//!                   ├── JoinRoom                 ─► PresenceNotifier::join
//!                   ├── ServerBroadcast          ─► BroadcastRouter (reliable)
//!                   ├── ServerVolatileBroadcast  ─► BroadcastRouter (volatile)
//!                   ├── UserFollow               ─► FollowGraph::set_follow
//!                   └── Upload/Delete/SetCurrent/Trail ─► media task ─► MediaStore
//! transport close ─► Relay::disconnect ─► PresenceNotifier::disconnect
//! ```
//!
//! Commands from one connection are handled in arrival order by the
//! transport task. Media commands are handed to their own tasks so a slow
//! store never holds up the connection that issued them; their outcome
//! reaches clients as events once the store call finishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::broadcast::{BroadcastRouter, DeliveryMode};
use crate::config::RelayConfig;
use crate::directory::{RoomDirectory, RoomId};
use crate::error::RelayError;
use crate::follow::{followee_of, FollowGraph};
use crate::presence::{CascadeReport, JoinOutcome, PresenceNotifier};
use crate::protocol::{ClientEvent, ConnectionId, FollowAction, ServerEvent};
use crate::registry::{Connection, ConnectionRegistry, Mailbox, Outbox};
use crate::storage::{
    ImageRecord, MediaStore, MemoryMediaStore, RocksMediaStore, StoreConfig, StoreError,
    TrailSample,
};

pub const IMAGE_NOT_FOUND: &str = "Image not found.";
pub const IMAGE_DELETE_FAILED: &str = "Error deleting image.";
pub const IMAGE_UPLOAD_FAILED: &str = "Error uploading image.";
pub const CURRENT_IMAGE_FAILED: &str = "Error setting current image.";
pub const TRAIL_UPDATE_FAILED: &str = "Error updating trail.";
pub const STORAGE_UNAVAILABLE: &str = "Media storage is not configured.";

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub active_rooms: usize,
    pub reliable_sent: u64,
    pub volatile_sent: u64,
    pub volatile_dropped: u64,
    pub rejected_commands: u64,
}

pub struct Relay {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<RoomDirectory>,
    presence: PresenceNotifier,
    follow: FollowGraph,
    router: BroadcastRouter,
    store: Option<Arc<dyn MediaStore>>,
    media_tasks: Mutex<JoinSet<()>>,
    rejected: AtomicU64,
}

/// A media command detached from its connection.
enum MediaCommand {
    Upload(ImageRecord),
    Delete(Uuid),
    SetCurrent(Uuid),
    Trail { file_name: String, sample: TrailSample },
}

impl Relay {
    /// Create a relay, opening the RocksDB media store when a storage path
    /// is configured and an in-memory store otherwise.
    pub fn new(config: RelayConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn MediaStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksMediaStore::open(StoreConfig::at(path))?),
            None => Arc::new(MemoryMediaStore::new()),
        };
        Ok(Self::with_store(config, Some(store)))
    }

    /// Create a relay with an explicit store (or none).
    pub fn with_store(config: RelayConfig, store: Option<Arc<dyn MediaStore>>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let directory = Arc::new(RoomDirectory::new());
        Self {
            presence: PresenceNotifier::new(directory.clone(), registry.clone()),
            follow: FollowGraph::new(directory.clone(), registry.clone()),
            router: BroadcastRouter::new(directory.clone(), config.volatile_queue_limit),
            config,
            registry,
            directory,
            store,
            media_tasks: Mutex::new(JoinSet::new()),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&Arc<dyn MediaStore>> {
        self.store.as_ref()
    }

    /// Register a new connection. `init-room` is already queued in the
    /// returned mailbox.
    pub async fn connect(&self) -> (ConnectionId, Mailbox) {
        let (conn, mailbox) = self.registry.register().await;
        log::info!("Connection {} registered", conn.id());
        (conn.id(), mailbox)
    }

    /// Run the disconnect cascade for `id`. Idempotent.
    pub async fn disconnect(&self, id: ConnectionId) -> Option<CascadeReport> {
        self.presence.disconnect(id).await
    }

    /// Dispatch one client command.
    ///
    /// A rejected command changes nothing and emits nothing; the error is
    /// returned for the transport to log.
    pub async fn handle(&self, id: ConnectionId, event: ClientEvent) -> Result<(), RelayError> {
        let result = self.dispatch(id, event).await;
        if let Err(e) = &result {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("Rejected command from {id}: {e}");
        }
        result
    }

    async fn dispatch(&self, id: ConnectionId, event: ClientEvent) -> Result<(), RelayError> {
        match event {
            ClientEvent::JoinRoom { room_id } => self.join(id, &room_id).await.map(|_| ()),
            ClientEvent::ServerBroadcast { room_id, payload } => self
                .broadcast(id, &room_id, payload, DeliveryMode::Reliable)
                .await
                .map(|_| ()),
            ClientEvent::ServerVolatileBroadcast { room_id, payload } => self
                .broadcast(id, &room_id, payload, DeliveryMode::Volatile)
                .await
                .map(|_| ()),
            ClientEvent::UserFollow { followee, action } => {
                self.set_follow(id, followee, action).await.map(|_| ())
            }
            ClientEvent::UploadImage {
                data,
                name,
                mime_type,
            } => {
                self.submit_media(id, MediaCommand::Upload(ImageRecord::new(data, name, mime_type)))
                    .await
            }
            ClientEvent::DeleteImage { image_id } => {
                self.submit_media(id, MediaCommand::Delete(image_id)).await
            }
            ClientEvent::SetCurrentImage { image_id } => {
                self.submit_media(id, MediaCommand::SetCurrent(image_id)).await
            }
            ClientEvent::TrailData { file_name, sample } => {
                self.submit_media(id, MediaCommand::Trail { file_name, sample })
                    .await
            }
        }
    }

    /// Join a session room. Follow rooms are only entered through
    /// [`Relay::set_follow`].
    pub async fn join(&self, id: ConnectionId, room_id: &str) -> Result<JoinOutcome, RelayError> {
        let room = RoomId::parse(room_id)?;
        if followee_of(&room).is_some() {
            return Err(RelayError::InvalidRoomId(room_id.to_string()));
        }
        let conn = self.connection(id).await?;
        self.presence.join(&conn, &room).await
    }

    pub async fn broadcast(
        &self,
        id: ConnectionId,
        room_id: &str,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<usize, RelayError> {
        let room = RoomId::parse(room_id)?;
        let conn = self.connection(id).await?;
        self.router.broadcast(&conn, &room, payload, mode).await
    }

    pub async fn set_follow(
        &self,
        id: ConnectionId,
        followee: ConnectionId,
        action: FollowAction,
    ) -> Result<Vec<ConnectionId>, RelayError> {
        let conn = self.connection(id).await?;
        self.follow.set_follow(&conn, followee, action).await
    }

    /// Current members of `room_id` (empty for unknown rooms).
    pub async fn members(&self, room_id: &str) -> Result<Vec<ConnectionId>, RelayError> {
        Ok(self.directory.members(&RoomId::parse(room_id)?).await)
    }

    pub async fn followers(&self, followee: ConnectionId) -> Vec<ConnectionId> {
        self.follow.followers(followee).await
    }

    /// Rooms `id` currently belongs to.
    #[cfg(test)]
    async fn rooms_of(&self, id: ConnectionId) -> Result<Vec<RoomId>, RelayError> {
        Ok(self.connection(id).await?.rooms().await)
    }

    pub async fn stats(&self) -> RelayStats {
        let broadcast = self.router.stats();
        RelayStats {
            total_connections: self.registry.total_connections(),
            active_connections: self.registry.len().await,
            active_rooms: self.directory.room_count().await,
            reliable_sent: broadcast.reliable_sent,
            volatile_sent: broadcast.volatile_sent,
            volatile_dropped: broadcast.volatile_dropped,
            rejected_commands: self.rejected.load(Ordering::Relaxed),
        }
    }

    // ─── Media ────────────────────────────────────────────────────────

    /// Hand a media command to its own task and return immediately.
    async fn submit_media(&self, id: ConnectionId, command: MediaCommand) -> Result<(), RelayError> {
        let origin = self.connection(id).await?.outbox().clone();
        let Some(store) = self.store.clone() else {
            send_error(&origin, STORAGE_UNAVAILABLE);
            return Ok(());
        };
        let registry = self.registry.clone();

        let mut tasks = self.media_tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(run_media(store, registry, origin, command));
        Ok(())
    }

    /// Wait for every media command accepted so far to finish.
    ///
    /// Pending commands are aborted when the relay is dropped.
    pub async fn settle(&self) {
        let mut tasks = std::mem::take(&mut *self.media_tasks.lock().await);
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                log::error!("Media task failed: {e}");
            }
        }
    }

    async fn connection(&self, id: ConnectionId) -> Result<Arc<Connection>, RelayError> {
        self.registry
            .get(id)
            .await
            .ok_or(RelayError::UnknownConnection(id))
    }
}

async fn run_media(
    store: Arc<dyn MediaStore>,
    registry: Arc<ConnectionRegistry>,
    origin: Outbox,
    command: MediaCommand,
) {
    let from = origin.id();
    match command {
        MediaCommand::Upload(image) => match blocking(store, move |s| s.insert_image(image)).await {
            Ok(image) => {
                log::debug!("{from} uploaded image {}", image.id);
                registry
                    .broadcast_all(Arc::new(ServerEvent::NewImage { image }))
                    .await;
            }
            Err(e) => {
                log::error!("Image upload from {from} failed: {e}");
                send_error(&origin, IMAGE_UPLOAD_FAILED);
            }
        },
        MediaCommand::Delete(image_id) => {
            match blocking(store, move |s| s.delete_image(image_id)).await {
                Ok(Some(_)) => {
                    log::debug!("{from} deleted image {image_id}");
                    registry
                        .broadcast_all(Arc::new(ServerEvent::ImageDeleted { image_id }))
                        .await;
                }
                Ok(None) => send_error(&origin, IMAGE_NOT_FOUND),
                Err(e) => {
                    log::error!("Deleting image {image_id} failed: {e}");
                    send_error(&origin, IMAGE_DELETE_FAILED);
                }
            }
        }
        MediaCommand::SetCurrent(image_id) => {
            match blocking(store, move |s| s.set_current_image(image_id)).await {
                Ok(image) => {
                    registry
                        .broadcast_all(Arc::new(ServerEvent::CurrentImageUpdated { image }))
                        .await;
                }
                Err(e) => {
                    log::error!("Setting current image {image_id} failed: {e}");
                    send_error(&origin, CURRENT_IMAGE_FAILED);
                }
            }
        }
        MediaCommand::Trail { file_name, sample } => {
            match blocking(store, move |s| s.append_trail(&file_name, sample)).await {
                Ok(len) => log::trace!("{from} trail sample stored ({len} total)"),
                Err(e) => {
                    log::error!("Trail update from {from} failed: {e}");
                    send_error(&origin, TRAIL_UPDATE_FAILED);
                }
            }
        }
    }
}

/// Run `op` on the blocking pool.
async fn blocking<T, F>(store: Arc<dyn MediaStore>, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn MediaStore) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .unwrap_or_else(|e| Err(StoreError::Unavailable(e.to_string())))
}

fn send_error(origin: &Outbox, message: &str) {
    origin.send(Arc::new(ServerEvent::ErrorMessage {
        message: message.to_string(),
    }));
}
