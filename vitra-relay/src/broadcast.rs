//! Fan-out of opaque payloads to the other members of a room.
//!
//! The payload is wrapped once in an `Arc<ServerEvent>` and the same
//! allocation is queued to every recipient. Delivery happens inside the
//! room lock, so sends from one connection to one room reach each
//! recipient in order.
//!
//! - Reliable: one enqueue per other member, never dropped here.
//! - Volatile: skipped for recipients whose backlog has reached the limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::directory::{RoomDirectory, RoomId};
use crate::error::RelayError;
use crate::protocol::ServerEvent;
use crate::registry::{Connection, VolatileDelivery};

/// Delivery guarantee requested by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Reliable,
    Volatile,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub reliable_sent: u64,
    pub volatile_sent: u64,
    pub volatile_dropped: u64,
    pub rejected: u64,
}

/// Lock-free counters behind `BroadcastStats`.
#[derive(Default)]
struct AtomicBroadcastStats {
    reliable_sent: AtomicU64,
    volatile_sent: AtomicU64,
    volatile_dropped: AtomicU64,
    rejected: AtomicU64,
}

pub struct BroadcastRouter {
    directory: Arc<RoomDirectory>,
    /// Undelivered events at which volatile sends start dropping.
    volatile_limit: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastRouter {
    pub fn new(directory: Arc<RoomDirectory>, volatile_limit: usize) -> Self {
        Self {
            directory,
            volatile_limit,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Deliver `payload` to every member of `room` except the sender.
    ///
    /// Returns the number of recipients the payload was queued for. An
    /// empty room is a no-op; a sender outside a non-empty room is rejected.
    pub async fn broadcast(
        &self,
        sender: &Connection,
        room: &RoomId,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<usize, RelayError> {
        let event = Arc::new(ServerEvent::ClientBroadcast { payload });
        let result = self
            .directory
            .with_room_as(sender, room, |view| {
                if view.is_empty() {
                    return Ok(0);
                }
                if !view.contains(sender.id()) {
                    return Err(RelayError::NotAMember {
                        sender: sender.id(),
                        room: room.to_string(),
                    });
                }

                let mut queued: usize = 0;
                for (id, outbox) in view.members() {
                    if *id == sender.id() {
                        continue;
                    }
                    match mode {
                        DeliveryMode::Reliable => {
                            if outbox.send(event.clone()) {
                                queued += 1;
                            }
                        }
                        DeliveryMode::Volatile => {
                            match outbox.send_volatile(event.clone(), self.volatile_limit) {
                                VolatileDelivery::Queued => queued += 1,
                                VolatileDelivery::Dropped => {
                                    self.stats.volatile_dropped.fetch_add(1, Ordering::Relaxed);
                                    log::trace!("Volatile update to {id} dropped (backlog)");
                                }
                                VolatileDelivery::Closed => {}
                            }
                        }
                    }
                }
                Ok(queued)
            })
            .await
            .and_then(|inner| inner);

        match &result {
            Ok(queued) => {
                let counter = match mode {
                    DeliveryMode::Reliable => &self.stats.reliable_sent,
                    DeliveryMode::Volatile => &self.stats.volatile_sent,
                };
                counter.fetch_add(*queued as u64, Ordering::Relaxed);
                log::trace!("{} sent {mode:?} update to {room} ({queued} recipients)", sender.id());
            }
            Err(_) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            reliable_sent: self.stats.reliable_sent.load(Ordering::Relaxed),
            volatile_sent: self.stats.volatile_sent.load(Ordering::Relaxed),
            volatile_dropped: self.stats.volatile_dropped.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn volatile_limit(&self) -> usize {
        self.volatile_limit
    }
}
