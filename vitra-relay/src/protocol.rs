//! Binary event protocol spoken between the relay and its clients.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded event:
//! ```text
//! client ── ClientEvent ──► relay
//! client ◄── ServerEvent ── relay
//! ```
//!
//! Broadcast payloads are opaque bytes; the relay never looks inside them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::storage::{ImageRecord, TrailSample};

/// Identifier of one live transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Follow or stop following another connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowAction {
    Follow,
    Unfollow,
}

/// Commands sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// `join-room`
    JoinRoom { room_id: String },
    /// `server-broadcast`: reliable fan-out to the other room members.
    ServerBroadcast { room_id: String, payload: Vec<u8> },
    /// `server-volatile-broadcast`: best-effort fan-out.
    ServerVolatileBroadcast { room_id: String, payload: Vec<u8> },
    /// `user-follow`
    UserFollow {
        followee: ConnectionId,
        action: FollowAction,
    },
    /// Persist an uploaded image and announce it to everyone.
    UploadImage {
        data: String,
        name: String,
        mime_type: String,
    },
    DeleteImage { image_id: Uuid },
    SetCurrentImage { image_id: Uuid },
    /// Append one drawing-trail sample to the named trail.
    TrailData { file_name: String, sample: TrailSample },
}

/// Events pushed by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Transport handshake: tells the client its own connection id.
    Hello { connection_id: ConnectionId },
    /// `init-room`: the relay accepts room commands from now on.
    InitRoom,
    /// `first-in-room`: the joiner is the only member.
    FirstInRoom,
    /// `new-member`
    NewMember { connection_id: ConnectionId },
    /// `room-membership-changed`: authoritative member set, unordered.
    RoomMembershipChanged { members: Vec<ConnectionId> },
    /// `client-broadcast`
    ClientBroadcast { payload: Vec<u8> },
    /// `follow-set-changed`, sent to the followee.
    FollowSetChanged { followers: Vec<ConnectionId> },
    /// `unfollowed-by-all`: the last follower went away.
    UnfollowedByAll,
    NewImage { image: ImageRecord },
    ImageDeleted { image_id: Uuid },
    CurrentImageUpdated { image: Option<ImageRecord> },
    /// A collaborator failure, reported to the originating client only.
    ErrorMessage { message: String },
}

impl ClientEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::ServerBroadcast { .. } => "server-broadcast",
            ClientEvent::ServerVolatileBroadcast { .. } => "server-volatile-broadcast",
            ClientEvent::UserFollow { .. } => "user-follow",
            ClientEvent::UploadImage { .. } => "upload",
            ClientEvent::DeleteImage { .. } => "delete-image",
            ClientEvent::SetCurrentImage { .. } => "set-current-image",
            ClientEvent::TrailData { .. } => "trail-data",
        }
    }
}

impl ServerEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Wire name of the event, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Hello { .. } => "hello",
            ServerEvent::InitRoom => "init-room",
            ServerEvent::FirstInRoom => "first-in-room",
            ServerEvent::NewMember { .. } => "new-member",
            ServerEvent::RoomMembershipChanged { .. } => "room-membership-changed",
            ServerEvent::ClientBroadcast { .. } => "client-broadcast",
            ServerEvent::FollowSetChanged { .. } => "follow-set-changed",
            ServerEvent::UnfollowedByAll => "unfollowed-by-all",
            ServerEvent::NewImage { .. } => "new-image",
            ServerEvent::ImageDeleted { .. } => "image-deleted",
            ServerEvent::CurrentImageUpdated { .. } => "current-image-updated",
            ServerEvent::ErrorMessage { .. } => "error-message",
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unexpected handshake: {0}")]
    Handshake(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display_parses_back() {
        let id = ConnectionId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.parse::<ConnectionId>().unwrap(), id);
    }

    #[test]
    fn test_broadcast_payload_survives_encoding() {
        let payload = vec![0u8, 255, 7, 42];
        let event = ClientEvent::ServerBroadcast {
            room_id: "r1".into(),
            payload: payload.clone(),
        };
        let decoded = ClientEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(
            decoded,
            ClientEvent::ServerBroadcast {
                room_id: "r1".into(),
                payload
            }
        );
    }

    #[test]
    fn test_follow_event_encoding() {
        let followee = ConnectionId::new();
        let event = ClientEvent::UserFollow {
            followee,
            action: FollowAction::Unfollow,
        };
        match ClientEvent::decode(&event.encode().unwrap()).unwrap() {
            ClientEvent::UserFollow { followee: f, action } => {
                assert_eq!(f, followee);
                assert_eq!(action, FollowAction::Unfollow);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_membership_event_encoding() {
        let members = vec![ConnectionId::new(), ConnectionId::new()];
        let event = ServerEvent::RoomMembershipChanged {
            members: members.clone(),
        };
        let decoded = ServerEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, ServerEvent::RoomMembershipChanged { members });
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ServerEvent::decode(&garbage).is_err());
        assert!(ClientEvent::decode(&garbage).is_err());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(ServerEvent::InitRoom.name(), "init-room");
        assert_eq!(ServerEvent::UnfollowedByAll.name(), "unfollowed-by-all");
        assert_eq!(
            ServerEvent::ClientBroadcast { payload: vec![] }.name(),
            "client-broadcast"
        );
    }

    #[test]
    fn test_large_payload() {
        let payload = vec![42u8; 65536];
        let event = ServerEvent::ClientBroadcast {
            payload: payload.clone(),
        };
        match ServerEvent::decode(&event.encode().unwrap()).unwrap() {
            ServerEvent::ClientBroadcast { payload: p } => assert_eq!(p, payload),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
