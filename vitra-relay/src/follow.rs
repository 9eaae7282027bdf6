//! Follow graph over follow rooms.
//!
//! A follow relation is membership in the room `follow@<followee>`; the
//! follower set of F is exactly the member set of `follow@F`. The room id
//! convention is parsed here and nowhere else.

use std::sync::Arc;

use crate::directory::{MembershipChange, RoomDirectory, RoomId, RoomView};
use crate::error::RelayError;
use crate::protocol::{ConnectionId, FollowAction, ServerEvent};
use crate::registry::{Connection, ConnectionRegistry, Outbox};

pub const FOLLOW_ROOM_PREFIX: &str = "follow@";

/// Room kind, derived from the room id alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomKind {
    Session,
    Follow { followee: ConnectionId },
}

/// Classify a raw room id.
///
/// Empty ids, and `follow@` ids whose suffix is not a canonical
/// connection id, are rejected.
pub fn classify(raw: &str) -> Result<RoomKind, RelayError> {
    if raw.is_empty() {
        return Err(RelayError::InvalidRoomId(raw.to_string()));
    }
    let Some(suffix) = raw.strip_prefix(FOLLOW_ROOM_PREFIX) else {
        return Ok(RoomKind::Session);
    };
    match suffix.parse::<ConnectionId>() {
        // Only the canonical spelling names the followee's room.
        Ok(followee) if followee.to_string() == suffix => Ok(RoomKind::Follow { followee }),
        _ => Err(RelayError::InvalidRoomId(raw.to_string())),
    }
}

/// The follow room whose members follow `followee`.
pub fn follow_room(followee: ConnectionId) -> RoomId {
    RoomId::from_parts(
        format!("{FOLLOW_ROOM_PREFIX}{followee}"),
        RoomKind::Follow { followee },
    )
}

/// Followee bound to `room`, if it is a follow room.
pub fn followee_of(room: &RoomId) -> Option<ConnectionId> {
    match room.kind() {
        RoomKind::Follow { followee } => Some(followee),
        RoomKind::Session => None,
    }
}

/// Follow/unfollow on top of the room directory.
pub struct FollowGraph {
    directory: Arc<RoomDirectory>,
    registry: Arc<ConnectionRegistry>,
}

impl FollowGraph {
    pub fn new(directory: Arc<RoomDirectory>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            directory,
            registry,
        }
    }

    /// Apply `action` and tell the followee its current follower set.
    ///
    /// Follow rooms produce no presence events; the only event is
    /// `follow-set-changed`, addressed to the followee. Returns the
    /// follower set after the change.
    pub async fn set_follow(
        &self,
        follower: &Connection,
        followee: ConnectionId,
        action: FollowAction,
    ) -> Result<Vec<ConnectionId>, RelayError> {
        let room = follow_room(followee);
        let followee_outbox = self.registry.outbox(followee).await;
        let notify = |change: MembershipChange, view: RoomView<'_>| {
            log::debug!(
                "{} {:?} {followee}: {change:?}, {} follower(s)",
                follower.id(),
                action,
                view.len()
            );
            notify_followee(followee_outbox.as_ref(), &view)
        };

        match action {
            FollowAction::Follow => self.directory.join(follower, &room, notify).await,
            FollowAction::Unfollow => {
                if !follower.is_connected().await {
                    return Err(RelayError::ConnectionClosed(follower.id()));
                }
                Ok(self.directory.leave(follower, &room, notify).await)
            }
        }
    }

    /// Current followers of `followee`.
    pub async fn followers(&self, followee: ConnectionId) -> Vec<ConnectionId> {
        self.directory.members(&follow_room(followee)).await
    }
}

fn notify_followee(followee: Option<&Outbox>, view: &RoomView<'_>) -> Vec<ConnectionId> {
    let followers = view.member_ids();
    if let Some(outbox) = followee {
        outbox.send(Arc::new(ServerEvent::FollowSetChanged {
            followers: followers.clone(),
        }));
    }
    followers
}
