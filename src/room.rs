//! Room actor implementation
//!
//! A room is a bounded-lifetime broadcast group. One task per room owns all
//! membership changes and fans every accepted envelope out to the members'
//! personal outboxes. Everything else talks to it through channels held by
//! the cloneable `Room` handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::AppError;
use crate::message::Envelope;
use crate::signal::CloseSignal;
use crate::types::{ClientId, RoomId};

/// Buffer size for join and leave requests
const CONTROL_BUFFER_SIZE: usize = 32;

/// Membership requests sent to the room task
///
/// Joins and leaves share one queue so a session's leave can never
/// overtake its own join.
enum RoomCommand {
    Join(Member),
    Leave(ClientId),
}

/// Notice written to every member when the room shuts down
pub const ROOM_CLOSED_NOTICE: &str = "room closed";

/// Where a room deregisters itself when it shuts down
///
/// Rooms only hold a `Weak` reference to their directory.
pub trait RoomDirectory: Send + Sync + 'static {
    /// Drop the entry for `id`; a no-op if it is already gone
    fn remove_room(&self, id: &RoomId);
}

/// A session as seen by its room
///
/// Dropping a member closes its outbox, which tells the session's outbound
/// pump to finish.
pub(crate) struct Member {
    pub(crate) id: ClientId,
    pub(crate) name: String,
    outbox: mpsc::Sender<Envelope>,
    connection: Arc<dyn Connection>,
}

impl Member {
    pub(crate) fn new(
        id: ClientId,
        name: String,
        outbox: mpsc::Sender<Envelope>,
        connection: Arc<dyn Connection>,
    ) -> Self {
        Self {
            id,
            name,
            outbox,
            connection,
        }
    }
}

type Members = Arc<Mutex<HashMap<ClientId, Member>>>;

/// Handle to a running room
///
/// Cheap to clone. Never mutates membership itself: joins, leaves and
/// envelopes are queued for the room's own task.
#[derive(Clone)]
pub struct Room {
    id: RoomId,
    commands: mpsc::Sender<RoomCommand>,
    inbox: mpsc::Sender<Envelope>,
    close: CloseSignal,
    members: Members,
}

impl Room {
    /// Create a room and start its control loop
    ///
    /// The room closes itself once `lifetime` elapses.
    pub(crate) fn spawn(
        id: RoomId,
        lifetime: Duration,
        config: &Config,
        directory: Weak<dyn RoomDirectory>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(CONTROL_BUFFER_SIZE);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity);
        let close = CloseSignal::new();
        let members: Members = Arc::new(Mutex::new(HashMap::new()));

        let actor = RoomActor {
            id: id.clone(),
            lifetime,
            write_wait: config.write_wait,
            commands: commands_rx,
            inbox_rx,
            inbox: inbox_tx.clone(),
            close: close.clone(),
            members: Arc::clone(&members),
            directory,
        };
        tokio::spawn(actor.run());

        Self {
            id,
            commands: commands_tx,
            inbox: inbox_tx,
            close,
            members,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Submit a join request
    ///
    /// Fails once the room is closing; the member (and its outbox) is
    /// dropped in that case.
    pub(crate) async fn join(&self, member: Member) -> Result<(), AppError> {
        if self.close.is_fired() {
            return Err(AppError::RoomClosed);
        }
        self.commands
            .send(RoomCommand::Join(member))
            .await
            .map_err(|_| AppError::RoomClosed)
    }

    /// Submit a leave request; ignored if the room is already gone
    pub async fn leave(&self, client_id: ClientId) {
        if self
            .commands
            .send(RoomCommand::Leave(client_id))
            .await
            .is_err()
        {
            debug!(room = %self.id, client = %client_id, "leave after room shutdown");
        }
    }

    /// Queue an envelope for fan-out
    ///
    /// Waits while the inbox is full.
    pub async fn submit(&self, envelope: Envelope) -> Result<(), AppError> {
        self.inbox
            .send(envelope)
            .await
            .map_err(|_| AppError::RoomClosed)
    }

    /// Request shutdown
    ///
    /// Returns true only for the call that actually triggered it.
    pub fn close(&self) -> bool {
        let fired = self.close.fire();
        if fired {
            info!(room = %self.id, "room close requested");
        }
        fired
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_fired()
    }

    pub fn member_count(&self) -> usize {
        lock(&self.members).len()
    }

    /// Display names of current members, sorted
    pub fn member_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.members)
            .values()
            .map(|m| m.name.clone())
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock(members: &Members) -> MutexGuard<'_, HashMap<ClientId, Member>> {
    members.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The room's control loop state
///
/// The only writer of `members`. The lock around it exists for readers on
/// other tasks and is never held across an await.
struct RoomActor {
    id: RoomId,
    lifetime: Duration,
    write_wait: Duration,
    commands: mpsc::Receiver<RoomCommand>,
    inbox_rx: mpsc::Receiver<Envelope>,
    /// Own inbox sender, used for best-effort leave notices
    inbox: mpsc::Sender<Envelope>,
    close: CloseSignal,
    members: Members,
    directory: Weak<dyn RoomDirectory>,
}

impl RoomActor {
    async fn run(mut self) {
        info!(room = %self.id, lifetime = ?self.lifetime, "room opened");

        let expiry = tokio::time::sleep(self.lifetime);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => match command {
                    RoomCommand::Join(member) => self.handle_join(member),
                    RoomCommand::Leave(client_id) => self.handle_leave(client_id),
                },
                Some(envelope) = self.inbox_rx.recv() => self.fan_out(envelope),
                () = &mut expiry, if !self.close.is_fired() => {
                    info!(room = %self.id, "room lifetime elapsed");
                    self.close.fire();
                }
                () = self.close.fired() => break,
            }
        }

        self.shutdown().await;
    }

    fn handle_join(&mut self, member: Member) {
        let notice = Envelope::system(format!("{} joined", member.name));
        info!(room = %self.id, client = %member.id, name = %member.name, "member joined");
        lock(&self.members).insert(member.id, member);
        self.fan_out(notice);
    }

    fn handle_leave(&mut self, client_id: ClientId) {
        let Some(member) = lock(&self.members).remove(&client_id) else {
            return;
        };
        info!(room = %self.id, client = %client_id, name = %member.name, "member left");

        let notice = Envelope::system(format!("{} left", member.name));
        drop(member);

        if self.inbox.try_send(notice).is_err() {
            warn!(room = %self.id, "inbox saturated, dropping leave notice");
        }
    }

    /// Push one envelope to every member without waiting
    ///
    /// A member whose outbox is full (or already closed) is evicted.
    fn fan_out(&mut self, envelope: Envelope) {
        let room = &self.id;
        lock(&self.members).retain(|client_id, member| {
            match member.outbox.try_send(envelope.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(room = %room, client = %client_id, name = %member.name, "outbox full, evicting slow member");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(room = %room, client = %client_id, "outbox closed, removing member");
                    false
                }
            }
        });
    }

    /// Notify and disconnect every member, then deregister
    async fn shutdown(mut self) {
        self.commands.close();
        self.inbox_rx.close();

        let mut departing: Vec<Member> = lock(&self.members).drain().map(|(_, m)| m).collect();
        // Joins queued before the close are torn down the same way
        while let Ok(command) = self.commands.try_recv() {
            if let RoomCommand::Join(member) = command {
                departing.push(member);
            }
        }

        let frame = match Envelope::system(ROOM_CLOSED_NOTICE).to_json() {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!(room = %self.id, "Failed to serialize closing notice: {}", e);
                None
            }
        };
        let deadline = Instant::now() + self.write_wait;
        let count = departing.len();

        join_all(departing.into_iter().map(|member| {
            let frame = frame.clone();
            let room = &self.id;
            async move {
                let Member {
                    id,
                    outbox,
                    connection,
                    ..
                } = member;
                if let Some(frame) = frame {
                    if let Err(e) = connection.write(frame, deadline).await {
                        debug!(room = %room, client = %id, "closing notice not delivered: {}", e);
                    }
                }
                drop(outbox);
                if let Err(e) = connection.close().await {
                    debug!(room = %room, client = %id, "close failed: {}", e);
                }
            }
        }))
        .await;

        if let Some(directory) = self.directory.upgrade() {
            directory.remove_room(&self.id);
        }
        info!(room = %self.id, members = count, "room closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::connection::mock::{self, MockPeer};
    use crate::message::EnvelopeKind;

    #[derive(Default)]
    struct RecordingDirectory {
        removed: StdMutex<Vec<RoomId>>,
    }

    impl RoomDirectory for RecordingDirectory {
        fn remove_room(&self, id: &RoomId) {
            self.removed.lock().unwrap().push(id.clone());
        }
    }

    impl RecordingDirectory {
        fn removed(&self) -> Vec<RoomId> {
            self.removed.lock().unwrap().clone()
        }
    }

    fn spawn_room(lifetime: Duration) -> (Room, Arc<RecordingDirectory>) {
        let directory = Arc::new(RecordingDirectory::default());
        let weak = Arc::downgrade(&directory);
        let room = Room::spawn(RoomId::generate(), lifetime, &Config::default(), weak);
        (room, directory)
    }

    fn member(name: &str, capacity: usize) -> (Member, mpsc::Receiver<Envelope>, MockPeer) {
        let (tx, rx) = mpsc::channel(capacity);
        let (conn, peer) = mock::pair();
        (Member::new(ClientId::new(), name.to_string(), tx, conn), rx, peer)
    }

    async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Option<Envelope> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for outbox")
    }

    async fn expect_closed(rx: &mut mpsc::Receiver<Envelope>) -> usize {
        let mut drained = 0;
        while recv(rx).await.is_some() {
            drained += 1;
        }
        drained
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_join_and_leave_membership() {
        let (room, _dir) = spawn_room(Duration::from_secs(60));
        let (alice, mut alice_rx, _alice_peer) = member("alice", 16);
        let (bob, mut bob_rx, _bob_peer) = member("bob", 16);
        let alice_id = alice.id;

        room.join(alice).await.unwrap();
        assert_eq!(recv(&mut alice_rx).await.unwrap().content, "alice joined");

        room.join(bob).await.unwrap();
        assert_eq!(recv(&mut alice_rx).await.unwrap().content, "bob joined");
        let notice = recv(&mut bob_rx).await.unwrap();
        assert_eq!(notice.kind, EnvelopeKind::System);
        assert_eq!(notice.content, "bob joined");
        assert_eq!(room.member_names(), vec!["alice", "bob"]);

        room.leave(alice_id).await;
        assert_eq!(expect_closed(&mut alice_rx).await, 0);
        assert_eq!(recv(&mut bob_rx).await.unwrap().content, "alice left");
        assert_eq!(room.member_names(), vec!["bob"]);

        // Repeated and unknown leaves are no-ops
        room.leave(alice_id).await;
        room.leave(ClientId::new()).await;
        room.submit(Envelope::message("bob", "still here", 64))
            .await
            .unwrap();
        assert_eq!(recv(&mut bob_rx).await.unwrap().content, "still here");
        assert_eq!(room.member_count(), 1);
    }

    #[tokio::test]
    async fn test_membership_replay() {
        let (room, _dir) = spawn_room(Duration::from_secs(60));
        let (a, mut a_rx, _pa) = member("a", 64);
        let (b, _b_rx, _pb) = member("b", 64);
        let (c, _c_rx, _pc) = member("c", 64);
        let (d, _d_rx, _pd) = member("d", 64);
        let (a_id, b_id) = (a.id, b.id);

        room.join(a).await.unwrap();
        room.join(b).await.unwrap();
        room.join(c).await.unwrap();
        room.leave(b_id).await;
        room.leave(b_id).await;
        room.join(d).await.unwrap();
        room.leave(a_id).await;

        // a's outbox closes once its leave has been processed
        expect_closed(&mut a_rx).await;
        wait_until(|| room.member_names() == vec!["c", "d"]).await;
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let (room, _dir) = spawn_room(Duration::from_secs(60));
        let (alice, mut alice_rx, _pa) = member("alice", 256);
        let (bob, mut bob_rx, _pb) = member("bob", 256);

        room.join(alice).await.unwrap();
        room.join(bob).await.unwrap();
        recv(&mut alice_rx).await.unwrap();
        recv(&mut alice_rx).await.unwrap();
        assert_eq!(recv(&mut bob_rx).await.unwrap().content, "bob joined");

        for i in 0..50 {
            room.submit(Envelope::message("alice", format!("m{i}"), 64))
                .await
                .unwrap();
        }

        for rx in [&mut alice_rx, &mut bob_rx] {
            for i in 0..50 {
                let env = recv(rx).await.unwrap();
                assert_eq!(env.kind, EnvelopeKind::Message);
                assert_eq!(env.content, format!("m{i}"));
            }
        }
    }

    #[tokio::test]
    async fn test_slow_member_evicted_without_stalling_others() {
        let (room, _dir) = spawn_room(Duration::from_secs(60));
        // Never drained: holds "slow joined" and "healthy joined", then is full
        let (slow, mut slow_rx, _ps) = member("slow", 2);
        let (healthy, mut healthy_rx, _ph) = member("healthy", 256);

        room.join(slow).await.unwrap();
        room.join(healthy).await.unwrap();
        assert_eq!(recv(&mut healthy_rx).await.unwrap().content, "healthy joined");

        for i in 0..10 {
            room.submit(Envelope::message("healthy", format!("m{i}"), 64))
                .await
                .unwrap();
        }
        for i in 0..10 {
            assert_eq!(recv(&mut healthy_rx).await.unwrap().content, format!("m{i}"));
        }

        assert_eq!(room.member_names(), vec!["healthy"]);
        // The slow member keeps what was queued before eviction, then sees the close
        assert_eq!(expect_closed(&mut slow_rx).await, 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (room, dir) = spawn_room(Duration::from_secs(60));
        let (alice, mut alice_rx, mut alice_peer) = member("alice", 16);
        room.join(alice).await.unwrap();
        recv(&mut alice_rx).await.unwrap();

        let closers: Vec<_> = (0..2)
            .map(|_| {
                let room = room.clone();
                tokio::spawn(async move { room.close() })
            })
            .collect();
        let mut fired = 0;
        for closer in closers {
            if closer.await.unwrap() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert!(!room.close());

        wait_until(|| !dir.removed().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dir.removed(), vec![room.id().clone()]);

        let notice = alice_peer.next_envelope().await.unwrap();
        assert_eq!(notice.kind, EnvelopeKind::System);
        assert_eq!(notice.content, ROOM_CLOSED_NOTICE);
        alice_peer.wait_closed().await;
        assert_eq!(alice_peer.conn.close_count(), 1);
        assert_eq!(expect_closed(&mut alice_rx).await, 0);
        assert_eq!(room.member_count(), 0);
    }

    #[tokio::test]
    async fn test_lifetime_expiry_closes_room() {
        let (room, dir) = spawn_room(Duration::from_millis(100));
        let (alice, _alice_rx, alice_peer) = member("alice", 16);
        room.join(alice).await.unwrap();

        alice_peer.wait_closed().await;
        wait_until(|| dir.removed().len() == 1).await;
        assert!(room.is_closed());
    }

    #[tokio::test]
    async fn test_join_after_close_rejected() {
        let (room, dir) = spawn_room(Duration::from_secs(60));
        room.close();

        let (late, _late_rx, _peer) = member("late", 16);
        assert!(matches!(room.join(late).await, Err(AppError::RoomClosed)));

        wait_until(|| dir.removed().len() == 1).await;
        assert!(room
            .submit(Envelope::message("late", "anyone?", 64))
            .await
            .is_err());
    }
}
