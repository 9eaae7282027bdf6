//! Presence notifier: join announcements and the disconnect cascade.
//!
//! ## Join
//!
//! ```text
//! join(c, R)
//!   │  (R locked)
//!   ├── |R| == 1 ──► first-in-room            → c
//!   └── |R| > 1  ──► new-member(c)            → R \ {c}
//!                    room-membership-changed  → R
//! ```
//!
//! ## Disconnect cascade
//!
//! Runs once per connection over the room snapshot taken when the
//! connection entered `Disconnecting`. Each room is handled inside its own
//! lock; session rooms announce the remaining members, follow rooms that
//! lost their last follower tell the followee.

use std::sync::Arc;

use crate::directory::{MembershipChange, RoomDirectory, RoomId, RoomView};
use crate::error::RelayError;
use crate::follow::followee_of;
use crate::protocol::{ConnectionId, ServerEvent};
use crate::registry::{Connection, ConnectionRegistry};

/// What a join announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Joiner is the only member; `first-in-room` was sent.
    FirstInRoom,
    /// Joined an occupied room; carries the announced member set.
    Joined(Vec<ConnectionId>),
    /// Already a member; nothing was sent.
    AlreadyMember,
}

/// Summary of one disconnect cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub rooms_left: usize,
    /// Session rooms that received `room-membership-changed`.
    pub rooms_notified: usize,
    /// Followees that received `unfollowed-by-all`.
    pub followees_notified: Vec<ConnectionId>,
}

pub struct PresenceNotifier {
    directory: Arc<RoomDirectory>,
    registry: Arc<ConnectionRegistry>,
}

impl PresenceNotifier {
    pub fn new(directory: Arc<RoomDirectory>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            directory,
            registry,
        }
    }

    /// Join `conn` to the session room `room` and announce it.
    pub async fn join(&self, conn: &Connection, room: &RoomId) -> Result<JoinOutcome, RelayError> {
        let outcome = self
            .directory
            .join(conn, room, |change, view| announce_join(conn, change, &view))
            .await?;
        log::debug!("{} joined {room}: {outcome:?}", conn.id());
        Ok(outcome)
    }

    /// Run the disconnect cascade and release the connection.
    ///
    /// Returns `None` if the cascade already ran (or the id is unknown).
    pub async fn disconnect(&self, id: ConnectionId) -> Option<CascadeReport> {
        let (conn, rooms) = self.registry.begin_disconnect(id).await?;
        log::debug!("{id} disconnecting from {} room(s)", rooms.len());

        let mut report = CascadeReport::default();
        for room in &rooms {
            match followee_of(room) {
                None => {
                    let notified = self
                        .directory
                        .leave(&conn, room, |change, view| announce_leave(change, &view))
                        .await;
                    if notified {
                        report.rooms_notified += 1;
                    }
                }
                Some(followee) => {
                    let outbox = if followee == id {
                        None
                    } else {
                        self.registry.outbox(followee).await
                    };
                    let abandoned = self
                        .directory
                        .leave(&conn, room, |change, view| {
                            let abandoned = change == MembershipChange::Left && view.is_empty();
                            if abandoned {
                                if let Some(outbox) = &outbox {
                                    outbox.send(Arc::new(ServerEvent::UnfollowedByAll));
                                }
                            }
                            abandoned
                        })
                        .await;
                    if abandoned && outbox.is_some() {
                        report.followees_notified.push(followee);
                    }
                }
            }
            report.rooms_left += 1;
        }

        self.registry.release(id).await;
        log::info!(
            "Connection {id} released ({} room(s), {} notified)",
            report.rooms_left,
            report.rooms_notified + report.followees_notified.len()
        );
        Some(report)
    }
}

fn announce_join(conn: &Connection, change: MembershipChange, view: &RoomView<'_>) -> JoinOutcome {
    if change != MembershipChange::Joined {
        return JoinOutcome::AlreadyMember;
    }
    if view.len() <= 1 {
        conn.outbox().send(Arc::new(ServerEvent::FirstInRoom));
        return JoinOutcome::FirstInRoom;
    }

    let new_member = Arc::new(ServerEvent::NewMember {
        connection_id: conn.id(),
    });
    for (id, outbox) in view.members() {
        if *id != conn.id() {
            outbox.send(new_member.clone());
        }
    }

    let members = view.member_ids();
    let changed = Arc::new(ServerEvent::RoomMembershipChanged {
        members: members.clone(),
    });
    for outbox in view.outboxes() {
        outbox.send(changed.clone());
    }
    JoinOutcome::Joined(members)
}

fn announce_leave(change: MembershipChange, view: &RoomView<'_>) -> bool {
    if change != MembershipChange::Left || view.is_empty() {
        return false;
    }
    let changed = Arc::new(ServerEvent::RoomMembershipChanged {
        members: view.member_ids(),
    });
    for outbox in view.outboxes() {
        outbox.send(changed.clone());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::follow::FollowGraph;
    use crate::protocol::FollowAction;
    use crate::registry::Mailbox;
    use std::collections::HashSet;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        directory: Arc<RoomDirectory>,
        presence: PresenceNotifier,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let directory = Arc::new(RoomDirectory::new());
        let presence = PresenceNotifier::new(directory.clone(), registry.clone());
        Fixture {
            registry,
            directory,
            presence,
        }
    }

    async fn connect(f: &Fixture) -> (Arc<Connection>, Mailbox) {
        let (conn, mut mailbox) = f.registry.register().await;
        mailbox.drain();
        (conn, mailbox)
    }

    fn events(mailbox: &mut Mailbox) -> Vec<ServerEvent> {
        mailbox.drain().iter().map(|e| (**e).clone()).collect()
    }

    fn id_set(ids: &[ConnectionId]) -> HashSet<ConnectionId> {
        ids.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_first_in_room() {
        let f = fixture();
        let (a, mut rx_a) = connect(&f).await;
        let r1 = RoomId::parse("r1").unwrap();

        let outcome = f.presence.join(&a, &r1).await.unwrap();

        assert_eq!(outcome, JoinOutcome::FirstInRoom);
        assert_eq!(events(&mut rx_a), vec![ServerEvent::FirstInRoom]);
    }

    #[tokio::test]
    async fn test_second_member_announced() {
        let f = fixture();
        let (a, mut rx_a) = connect(&f).await;
        let (b, mut rx_b) = connect(&f).await;
        let r1 = RoomId::parse("r1").unwrap();

        f.presence.join(&a, &r1).await.unwrap();
        rx_a.drain();
        f.presence.join(&b, &r1).await.unwrap();

        let a_events = events(&mut rx_a);
        assert_eq!(a_events.len(), 2);
        assert_eq!(a_events[0], ServerEvent::NewMember { connection_id: b.id() });
        match &a_events[1] {
            ServerEvent::RoomMembershipChanged { members } => {
                assert_eq!(id_set(members), id_set(&[a.id(), b.id()]));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let b_events = events(&mut rx_b);
        assert_eq!(b_events.len(), 1);
        match &b_events[0] {
            ServerEvent::RoomMembershipChanged { members } => assert_eq!(members.len(), 2),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejoin_emits_nothing() {
        let f = fixture();
        let (a, mut rx_a) = connect(&f).await;
        let r1 = RoomId::parse("r1").unwrap();

        f.presence.join(&a, &r1).await.unwrap();
        rx_a.drain();

        assert_eq!(f.presence.join(&a, &r1).await.unwrap(), JoinOutcome::AlreadyMember);
        assert!(rx_a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_cascade_announces_remaining() {
        let f = fixture();
        let (a, mut rx_a) = connect(&f).await;
        let (b, _rx_b) = connect(&f).await;
        let r1 = RoomId::parse("r1").unwrap();
        f.presence.join(&a, &r1).await.unwrap();
        f.presence.join(&b, &r1).await.unwrap();
        rx_a.drain();

        let report = f.presence.disconnect(b.id()).await.unwrap();

        assert_eq!(report.rooms_left, 1);
        assert_eq!(report.rooms_notified, 1);
        assert_eq!(
            events(&mut rx_a),
            vec![ServerEvent::RoomMembershipChanged { members: vec![a.id()] }]
        );
        assert!(f.registry.get(b.id()).await.is_none());
        assert_eq!(f.directory.members(&r1).await, vec![a.id()]);
    }

    #[tokio::test]
    async fn test_cascade_last_member_silent() {
        let f = fixture();
        let (a, _rx_a) = connect(&f).await;
        let r1 = RoomId::parse("r1").unwrap();
        f.presence.join(&a, &r1).await.unwrap();

        let report = f.presence.disconnect(a.id()).await.unwrap();

        assert_eq!(report.rooms_notified, 0);
        assert_eq!(f.directory.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_cascade_unfollowed_by_all_once() {
        let f = fixture();
        let follow = FollowGraph::new(f.directory.clone(), f.registry.clone());
        let (a, _rx_a) = connect(&f).await;
        let (c, _rx_c) = connect(&f).await;
        let (b, mut rx_b) = connect(&f).await;

        follow.set_follow(&a, b.id(), FollowAction::Follow).await.unwrap();
        follow.set_follow(&c, b.id(), FollowAction::Follow).await.unwrap();
        rx_b.drain();

        // Another follower remains: no event for b.
        let report = f.presence.disconnect(a.id()).await.unwrap();
        assert!(report.followees_notified.is_empty());
        assert!(rx_b.drain().is_empty());

        let report = f.presence.disconnect(c.id()).await.unwrap();
        assert_eq!(report.followees_notified, vec![b.id()]);
        assert_eq!(events(&mut rx_b), vec![ServerEvent::UnfollowedByAll]);
    }

    #[tokio::test]
    async fn test_cascade_runs_once() {
        let f = fixture();
        let (a, _rx_a) = connect(&f).await;

        assert!(f.presence.disconnect(a.id()).await.is_some());
        assert!(f.presence.disconnect(a.id()).await.is_none());
    }
}
