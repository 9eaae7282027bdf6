use crate::protocol::ConnectionId;

/// Invalid operations rejected by the relay.
///
/// A rejected command leaves relay state untouched and emits no events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid room id: {0:?}")]
    InvalidRoomId(String),
    #[error("Connection {sender} is not a member of room {room}")]
    NotAMember { sender: ConnectionId, room: String },
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error("Connection {0} is disconnecting")]
    ConnectionClosed(ConnectionId),
}
