//! Room directory: room id → member set.
//!
//! Every room has its own mutex. Membership changes, and the callback that
//! turns a change into events, run while that mutex is held, so observers
//! never see a member set that was not current at the time it was emitted.
//!
//! ```text
//! rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>
//!                                   │
//!              lock order: room ────┴──► connection
//! ```
//!
//! A room is created on first join and retired as soon as it is empty.
//! A caller still holding a handle to a retired room retries on a fresh one.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::error::RelayError;
use crate::follow::{self, RoomKind};
use crate::protocol::ConnectionId;
use crate::registry::{Connection, ConnectionState, Outbox};

/// Validated room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId {
    raw: String,
    kind: RoomKind,
}

impl RoomId {
    /// Validate a client-chosen room id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, RelayError> {
        let raw = raw.into();
        let kind = follow::classify(&raw)?;
        Ok(Self { raw, kind })
    }

    pub(crate) fn from_parts(raw: String, kind: RoomKind) -> Self {
        Self { raw, kind }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// What a join or leave did to the member set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Joined,
    AlreadyMember,
    Left,
    NotMember,
}

/// Read-only view of a room's members, valid inside the room lock.
pub struct RoomView<'a> {
    room: &'a RoomId,
    members: &'a BTreeMap<ConnectionId, Outbox>,
}

impl<'a> RoomView<'a> {
    pub fn room(&self) -> &RoomId {
        self.room
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.members.keys().copied().collect()
    }

    pub fn members(&self) -> impl Iterator<Item = (&ConnectionId, &Outbox)> {
        self.members.iter()
    }

    pub fn outboxes(&self) -> impl Iterator<Item = &Outbox> {
        self.members.values()
    }
}

struct Room {
    members: BTreeMap<ConnectionId, Outbox>,
    retired: bool,
}

type RoomHandle = Arc<Mutex<Room>>;

/// Maps room ids to their member sets.
pub struct RoomDirectory {
    rooms: RwLock<HashMap<RoomId, RoomHandle>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Add `conn` to `room` and run `notify` inside the room lock.
    ///
    /// Rejected with `ConnectionClosed` once the connection is no longer
    /// `Connected`.
    pub async fn join<F, R>(&self, conn: &Connection, room: &RoomId, notify: F) -> Result<R, RelayError>
    where
        F: FnOnce(MembershipChange, RoomView<'_>) -> R,
    {
        loop {
            let handle = self.get_or_create(room).await;
            let mut guard = handle.lock().await;
            if guard.retired {
                continue;
            }

            let change = {
                let mut inner = conn.inner.lock().await;
                if inner.state != ConnectionState::Connected {
                    None
                } else if guard.members.contains_key(&conn.id()) {
                    Some(MembershipChange::AlreadyMember)
                } else {
                    guard.members.insert(conn.id(), conn.outbox().clone());
                    inner.rooms.insert(room.clone());
                    Some(MembershipChange::Joined)
                }
            };

            let Some(change) = change else {
                if guard.members.is_empty() {
                    self.retire(room, &handle, &mut guard).await;
                }
                return Err(RelayError::ConnectionClosed(conn.id()));
            };

            let view = RoomView {
                room,
                members: &guard.members,
            };
            return Ok(notify(change, view));
        }
    }

    /// Remove `conn` from `room` and run `notify` inside the room lock.
    ///
    /// Removing a non-member is a no-op reported as `NotMember`.
    pub async fn leave<F, R>(&self, conn: &Connection, room: &RoomId, notify: F) -> R
    where
        F: FnOnce(MembershipChange, RoomView<'_>) -> R,
    {
        let empty = BTreeMap::new();
        let Some(handle) = self.handle(room).await else {
            return notify(
                MembershipChange::NotMember,
                RoomView {
                    room,
                    members: &empty,
                },
            );
        };

        let mut guard = handle.lock().await;
        if guard.retired {
            return notify(
                MembershipChange::NotMember,
                RoomView {
                    room,
                    members: &empty,
                },
            );
        }

        let change = {
            let mut inner = conn.inner.lock().await;
            if guard.members.remove(&conn.id()).is_some() {
                inner.rooms.remove(room);
                MembershipChange::Left
            } else {
                MembershipChange::NotMember
            }
        };

        let result = notify(
            change,
            RoomView {
                room,
                members: &guard.members,
            },
        );

        if guard.members.is_empty() {
            self.retire(room, &handle, &mut guard).await;
        }
        result
    }

    /// Run `f` over the members of `room` on behalf of `sender`.
    ///
    /// A missing room is presented as empty. Rejected with
    /// `ConnectionClosed` once the sender is no longer `Connected`.
    pub async fn with_room_as<F, R>(&self, sender: &Connection, room: &RoomId, f: F) -> Result<R, RelayError>
    where
        F: FnOnce(RoomView<'_>) -> R,
    {
        let empty = BTreeMap::new();
        let Some(handle) = self.handle(room).await else {
            return Ok(f(RoomView {
                room,
                members: &empty,
            }));
        };

        let guard = handle.lock().await;
        if guard.retired {
            return Ok(f(RoomView {
                room,
                members: &empty,
            }));
        }
        if sender.state().await != ConnectionState::Connected {
            return Err(RelayError::ConnectionClosed(sender.id()));
        }

        Ok(f(RoomView {
            room,
            members: &guard.members,
        }))
    }

    /// Current members of `room`, empty if the room does not exist.
    pub async fn members(&self, room: &RoomId) -> Vec<ConnectionId> {
        let Some(handle) = self.handle(room).await else {
            return Vec::new();
        };
        let guard = handle.lock().await;
        guard.members.keys().copied().collect()
    }

    /// Number of non-empty rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Point-in-time copy of every room's member set.
    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> HashMap<RoomId, Vec<ConnectionId>> {
        let handles: Vec<(RoomId, RoomHandle)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();

        let mut snapshot = HashMap::with_capacity(handles.len());
        for (id, handle) in handles {
            let guard = handle.lock().await;
            if !guard.retired {
                snapshot.insert(id, guard.members.keys().copied().collect());
            }
        }
        snapshot
    }

    async fn handle(&self, room: &RoomId) -> Option<RoomHandle> {
        self.rooms.read().await.get(room).cloned()
    }

    async fn get_or_create(&self, room: &RoomId) -> RoomHandle {
        // Fast path: read lock
        if let Some(handle) = self.handle(room).await {
            return handle;
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.clone())
            .or_insert_with(|| {
                log::debug!("Room {room} created");
                Arc::new(Mutex::new(Room {
                    members: BTreeMap::new(),
                    retired: false,
                }))
            })
            .clone()
    }

    /// Forget an empty room. Called with the room lock held.
    async fn retire(&self, room: &RoomId, handle: &RoomHandle, guard: &mut MutexGuard<'_, Room>) {
        guard.retired = true;
        let mut rooms = self.rooms.write().await;
        if rooms.get(room).is_some_and(|current| Arc::ptr_eq(current, handle)) {
            rooms.remove(room);
            log::debug!("Room {room} removed (empty)");
        }
    }
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;

    fn room(raw: &str) -> RoomId {
        RoomId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_join_creates_room_lazily() {
        let registry = ConnectionRegistry::new();
        let directory = RoomDirectory::new();
        let (a, _rx) = registry.register().await;

        assert_eq!(directory.room_count().await, 0);
        let change = directory
            .join(&a, &room("r1"), |change, view| {
                assert_eq!(view.len(), 1);
                change
            })
            .await
            .unwrap();

        assert_eq!(change, MembershipChange::Joined);
        assert_eq!(directory.room_count().await, 1);
        assert_eq!(directory.members(&room("r1")).await, vec![a.id()]);
        assert_eq!(a.rooms().await, vec![room("r1")]);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let directory = RoomDirectory::new();
        let (a, _rx) = registry.register().await;

        directory.join(&a, &room("r1"), |_, _| ()).await.unwrap();
        let change = directory.join(&a, &room("r1"), |c, _| c).await.unwrap();

        assert_eq!(change, MembershipChange::AlreadyMember);
        assert_eq!(directory.members(&room("r1")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_retires_empty_room() {
        let registry = ConnectionRegistry::new();
        let directory = RoomDirectory::new();
        let (a, _rx) = registry.register().await;

        directory.join(&a, &room("r1"), |_, _| ()).await.unwrap();
        let change = directory.leave(&a, &room("r1"), |c, view| {
            assert!(view.is_empty());
            c
        })
        .await;

        assert_eq!(change, MembershipChange::Left);
        assert_eq!(directory.room_count().await, 0);
        assert!(a.rooms().await.is_empty());

        // Leaving again is a no-op.
        let change = directory.leave(&a, &room("r1"), |c, _| c).await;
        assert_eq!(change, MembershipChange::NotMember);
    }

    #[tokio::test]
    async fn test_rejoin_after_retire() {
        let registry = ConnectionRegistry::new();
        let directory = RoomDirectory::new();
        let (a, _rx) = registry.register().await;

        directory.join(&a, &room("r1"), |_, _| ()).await.unwrap();
        directory.leave(&a, &room("r1"), |_, _| ()).await;
        let change = directory.join(&a, &room("r1"), |c, _| c).await.unwrap();

        assert_eq!(change, MembershipChange::Joined);
        assert_eq!(directory.members(&room("r1")).await, vec![a.id()]);
    }

    #[tokio::test]
    async fn test_join_rejected_while_disconnecting() {
        let registry = ConnectionRegistry::new();
        let directory = RoomDirectory::new();
        let (a, _rx) = registry.register().await;

        registry.begin_disconnect(a.id()).await.unwrap();
        let result = directory.join(&a, &room("r1"), |_, _| ()).await;

        assert_eq!(result, Err(RelayError::ConnectionClosed(a.id())));
        assert_eq!(directory.room_count().await, 0);
        assert!(a.rooms().await.is_empty());
    }

    #[tokio::test]
    async fn test_with_room_as_missing_room_is_empty() {
        let registry = ConnectionRegistry::new();
        let directory = RoomDirectory::new();
        let (a, _rx) = registry.register().await;

        let len = directory
            .with_room_as(&a, &room("nowhere"), |view| view.len())
            .await
            .unwrap();
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn test_snapshot_matches_connection_rooms() {
        let registry = ConnectionRegistry::new();
        let directory = RoomDirectory::new();
        let (a, _ra) = registry.register().await;
        let (b, _rb) = registry.register().await;

        directory.join(&a, &room("r1"), |_, _| ()).await.unwrap();
        directory.join(&b, &room("r1"), |_, _| ()).await.unwrap();
        directory.join(&b, &room("r2"), |_, _| ()).await.unwrap();

        let snapshot = directory.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        for (room_id, members) in &snapshot {
            for member in members {
                let conn = registry.get(*member).await.unwrap();
                assert!(conn.rooms().await.contains(room_id));
            }
        }
        let mut b_rooms: Vec<String> = b.rooms().await.iter().map(|r| r.to_string()).collect();
        b_rooms.sort();
        assert_eq!(b_rooms, vec!["r1", "r2"]);
    }
}
