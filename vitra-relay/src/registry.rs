//! Connection registry: the set of live connections.
//!
//! Each connection owns its room set, its lifecycle state and an outbox.
//! The outbox is an unbounded queue with an atomic depth counter so that
//! enqueueing never blocks while a room lock is held, and volatile events
//! can be shed when a slow consumer falls behind.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::directory::RoomId;
use crate::protocol::{ConnectionId, ServerEvent};

/// Lifecycle of a connection. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Disconnect cascade running.
    Disconnecting,
    Released,
}

/// Result of a volatile enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatileDelivery {
    Queued,
    /// Recipient backlog at or above the limit.
    Dropped,
    /// Recipient mailbox is gone.
    Closed,
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Arc<ServerEvent>>,
    depth: Arc<AtomicUsize>,
}

impl Outbox {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event that must not be dropped by the relay.
    ///
    /// Returns false if the receiving side has gone away.
    pub fn send(&self, event: Arc<ServerEvent>) -> bool {
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(event).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Queue an event unless `limit` or more events are still undelivered.
    pub fn send_volatile(&self, event: Arc<ServerEvent>, limit: usize) -> VolatileDelivery {
        if self.depth.load(Ordering::Acquire) >= limit {
            return VolatileDelivery::Dropped;
        }
        if self.send(event) {
            VolatileDelivery::Queued
        } else {
            VolatileDelivery::Closed
        }
    }

    /// Events queued but not yet taken by the mailbox owner.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

/// Receiving half of a connection's outbound queue.
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Arc<ServerEvent>>,
    depth: Arc<AtomicUsize>,
}

impl Mailbox {
    /// Wait for the next event. `None` once the connection is released
    /// and every queued event has been taken.
    pub async fn recv(&mut self) -> Option<Arc<ServerEvent>> {
        let event = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Arc<ServerEvent>> {
        let event = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    /// Take every queued event.
    pub fn drain(&mut self) -> Vec<Arc<ServerEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

fn outbound_queue(id: ConnectionId) -> (Outbox, Mailbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        Outbox {
            id,
            tx,
            depth: depth.clone(),
        },
        Mailbox { rx, depth },
    )
}

pub(crate) struct ConnectionInner {
    pub(crate) state: ConnectionState,
    pub(crate) rooms: HashSet<RoomId>,
}

/// A live connection.
///
/// The room set is only mutated by the room directory while it holds the
/// corresponding room lock, which keeps both sides of the membership
/// relation consistent.
pub struct Connection {
    id: ConnectionId,
    outbox: Outbox,
    pub(crate) inner: Mutex<ConnectionInner>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Rooms this connection currently belongs to.
    pub async fn rooms(&self) -> Vec<RoomId> {
        self.inner.lock().await.rooms.iter().cloned().collect()
    }

    /// Enter `Disconnecting` and snapshot the room set, atomically.
    ///
    /// Only the first call gets a snapshot.
    async fn begin_disconnect(&self) -> Option<Vec<RoomId>> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            return None;
        }
        inner.state = ConnectionState::Disconnecting;
        Some(inner.rooms.iter().cloned().collect())
    }
}

/// Owns every live connection.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    total_connections: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            total_connections: AtomicU64::new(0),
        }
    }

    /// Create a connection and queue `init-room` to it.
    pub async fn register(&self) -> (Arc<Connection>, Mailbox) {
        let id = ConnectionId::new();
        let (outbox, mailbox) = outbound_queue(id);
        let connection = Arc::new(Connection {
            id,
            outbox,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Connected,
                rooms: HashSet::new(),
            }),
        });

        self.connections.write().await.insert(id, connection.clone());
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        connection.outbox.send(Arc::new(ServerEvent::InitRoom));
        log::debug!("Registered connection {id}");
        (connection, mailbox)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn outbox(&self, id: ConnectionId) -> Option<Outbox> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|c| c.outbox.clone())
    }

    /// Start the disconnect cascade for `id`.
    ///
    /// Returns the connection and its room snapshot the first time only.
    pub async fn begin_disconnect(&self, id: ConnectionId) -> Option<(Arc<Connection>, Vec<RoomId>)> {
        let connection = self.get(id).await?;
        let rooms = connection.begin_disconnect().await?;
        Some((connection, rooms))
    }

    /// Drop a connection whose cascade has completed.
    pub async fn release(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(&id);
        match removed {
            Some(connection) => {
                let mut inner = connection.inner.lock().await;
                inner.state = ConnectionState::Released;
                inner.rooms.clear();
                log::debug!("Released connection {id}");
                true
            }
            None => false,
        }
    }

    /// Queue an event to every live connection. Returns the number queued.
    pub async fn broadcast_all(&self, event: Arc<ServerEvent>) -> usize {
        let outboxes: Vec<Outbox> = self
            .connections
            .read()
            .await
            .values()
            .map(|c| c.outbox.clone())
            .collect();
        outboxes.iter().filter(|o| o.send(event.clone())).count()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().copied().collect()
    }

    /// Connections registered since startup.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
