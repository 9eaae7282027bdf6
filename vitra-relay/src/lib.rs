//! # vitra-relay: presence and broadcast relay for collaborative rooms
//!
//! Clients join named rooms, receive membership announcements, fan opaque
//! payloads out to the other members (reliable or volatile), follow one
//! another through `follow@<connectionId>` rooms, and are cleaned out of
//! every room when their transport goes away.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer │
//! │ (per user)  │    bincode frames   │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │    Relay    │──► MediaStore (memory / RocksDB)
//!                                     └──────┬──────┘
//!         ┌──────────────┬───────────────┬───┴──────────┬──────────────┐
//!         ▼              ▼               ▼              ▼              ▼
//!  ConnectionRegistry RoomDirectory PresenceNotifier FollowGraph BroadcastRouter
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire events (bincode-encoded `ClientEvent` / `ServerEvent`)
//! - [`registry`]: Connections, lifecycle state and outbound queues
//! - [`directory`]: Room membership under per-room locks
//! - [`presence`]: Join announcements and the disconnect cascade
//! - [`follow`]: Follow rooms and follower-set notifications
//! - [`broadcast`]: Reliable and volatile fan-out
//! - [`relay`]: Command dispatch over all of the above
//! - [`storage`]: Image and trail persistence
//! - [`align`]: Recording alignment planner
//! - [`server`] / [`client`]: WebSocket transport

pub mod align;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod follow;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastRouter, BroadcastStats, DeliveryMode};
pub use client::{ClientState, RelayClient};
pub use config::RelayConfig;
pub use directory::{MembershipChange, RoomDirectory, RoomId};
pub use error::RelayError;
pub use follow::{FollowGraph, RoomKind, FOLLOW_ROOM_PREFIX};
pub use presence::{CascadeReport, JoinOutcome, PresenceNotifier};
pub use protocol::{ClientEvent, ConnectionId, FollowAction, ProtocolError, ServerEvent};
pub use registry::{Connection, ConnectionRegistry, ConnectionState, Mailbox, Outbox};
pub use relay::{Relay, RelayStats};
pub use server::RelayServer;
pub use storage::{
    ImageRecord, MediaStore, MemoryMediaStore, RocksMediaStore, StoreConfig, StoreError,
    TrailSample,
};
