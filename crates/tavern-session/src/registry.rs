//! The connection registry: every live connection and the room it is in.
//!
//! The registry owns the outbound side of each connection. A connection is
//! represented here by a bounded queue ([`mpsc::Sender`]) drained by that
//! connection's writer task, plus a [`Notify`] the registry uses to ask the
//! connection to shut down.
//!
//! # Fan-out
//!
//! [`broadcast`](ConnectionRegistry::broadcast) never waits on a peer. It
//! uses `try_send` against each queue:
//!
//! - queue closed → the connection is tearing down, skip it silently
//! - queue full → the peer is not keeping up, kick it and skip it
//!
//! so one slow or broken client can't stall delivery to the rest of the
//! room.
//!
//! # Concurrency
//!
//! The index sits behind a `std::sync::Mutex` and no critical section
//! awaits. A broadcast holds the lock only long enough to copy the room's
//! outlets; the `try_send` calls run after it is released, so fan-out in
//! one room does not hold up lookups or fan-out in another.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tavern_protocol::{ErrorCode, RoomId, ServerMessage, UserId};
use tavern_transport::ConnectionId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};

use crate::{ConnectionInfo, Departure, SessionError};

/// A message queued for one connection. Shared so a broadcast encodes the
/// value once and clones only the pointer per recipient.
pub type Outbound = Arc<ServerMessage>;

/// Handles returned by [`ConnectionRegistry::register`].
#[derive(Debug)]
pub struct Registration {
    /// Notified when the registry wants this connection closed (replaced by
    /// a newer session, fell behind, or server shutdown).
    pub kick: Arc<Notify>,
    /// The older connection of the same user that this registration
    /// displaced. The caller must run the room-level leave for it.
    pub replaced: Option<Departure>,
}

/// The sending half of one connection. Shared with in-flight broadcasts.
struct Outlet {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<Outbound>,
    kick: Arc<Notify>,
    /// Set once the connection has been kicked for falling behind, so the
    /// warning is logged once.
    lagging: AtomicBool,
}

impl Outlet {
    /// Queues `msg` without waiting. Returns `true` if it was queued.
    fn deliver(&self, msg: &Outbound) -> bool {
        match self.outbound.try_send(Arc::clone(msg)) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(_)) => {
                if !self.lagging.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        connection_id = %self.id,
                        user_id = %self.user_id,
                        "outbound queue full, disconnecting slow peer"
                    );
                    self.kick.notify_one();
                }
                false
            }
        }
    }
}

struct Entry {
    room: Option<RoomId>,
    last_seen: Instant,
    outlet: Arc<Outlet>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Entry>,
    by_user: HashMap<UserId, ConnectionId>,
    rooms: HashMap<RoomId, BTreeSet<ConnectionId>>,
}

impl Inner {
    fn unindex_room(&mut self, id: ConnectionId, room: &RoomId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    fn remove(&mut self, id: ConnectionId) -> Option<(Departure, Entry)> {
        let mut entry = self.connections.remove(&id)?;
        let user_id = entry.outlet.user_id.clone();
        if self.by_user.get(&user_id) == Some(&id) {
            self.by_user.remove(&user_id);
        }
        let room = entry.room.take();
        if let Some(room) = &room {
            self.unindex_room(id, room);
        }
        let departure = Departure {
            connection_id: id,
            user_id,
            room,
        };
        Some((departure, entry))
    }

    fn outlet(&self, id: ConnectionId) -> Option<Arc<Outlet>> {
        self.connections.get(&id).map(|e| Arc::clone(&e.outlet))
    }
}

/// Tracks live connections, their identity, and their current room.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // No critical section leaves the maps half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an authenticated connection.
    ///
    /// A user holds at most one live connection. If `user_id` is already
    /// connected elsewhere, that older connection is removed, sent a
    /// `SessionReplaced` error, and kicked; its [`Departure`] comes back
    /// in [`Registration::replaced`].
    pub async fn register(
        &self,
        id: ConnectionId,
        user_id: UserId,
        outbound: mpsc::Sender<Outbound>,
    ) -> Registration {
        let mut inner = self.lock();

        // Re-registering the same id replaces its entry outright.
        inner.remove(id);

        let replaced = match inner.by_user.get(&user_id).copied() {
            Some(old) => inner.remove(old).map(|(departure, entry)| {
                let notice = Arc::new(ServerMessage::error(
                    ErrorCode::SessionReplaced,
                    "signed in from another connection",
                ));
                let _ = entry.outlet.outbound.try_send(notice);
                entry.outlet.kick.notify_one();
                tracing::info!(
                    connection_id = %old,
                    replaced_by = %id,
                    %user_id,
                    "session replaced"
                );
                departure
            }),
            None => None,
        };

        let kick = Arc::new(Notify::new());
        inner.by_user.insert(user_id.clone(), id);
        inner.connections.insert(
            id,
            Entry {
                room: None,
                last_seen: Instant::now(),
                outlet: Arc::new(Outlet {
                    id,
                    user_id,
                    outbound,
                    kick: Arc::clone(&kick),
                    lagging: AtomicBool::new(false),
                }),
            },
        );
        tracing::debug!(connection_id = %id, "connection registered");

        Registration { kick, replaced }
    }

    /// Removes a connection.
    ///
    /// Idempotent: the second call for the same id returns `None`. The
    /// connection leaves the room index before this returns, so no later
    /// broadcast can reach it.
    pub async fn deregister(&self, id: ConnectionId) -> Option<Departure> {
        let removed = self.lock().remove(id);
        removed.map(|(departure, _)| {
            tracing::debug!(connection_id = %id, room = ?departure.room, "connection deregistered");
            departure
        })
    }

    /// Attaches a connection to a room, detaching it from any previous one.
    ///
    /// Returns the previous room, if it was different.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the connection isn't registered.
    pub async fn attach(
        &self,
        id: ConnectionId,
        room: RoomId,
    ) -> Result<Option<RoomId>, SessionError> {
        let mut inner = self.lock();
        let entry = inner
            .connections
            .get_mut(&id)
            .ok_or(SessionError::NotFound(id))?;
        let previous = entry.room.replace(room.clone());
        if let Some(prev) = &previous {
            inner.unindex_room(id, prev);
        }
        inner.rooms.entry(room.clone()).or_default().insert(id);
        Ok(previous.filter(|prev| *prev != room))
    }

    /// Detaches a connection from its room. Returns the room it was in.
    pub async fn detach(&self, id: ConnectionId) -> Option<RoomId> {
        let mut inner = self.lock();
        let room = inner.connections.get_mut(&id)?.room.take()?;
        inner.unindex_room(id, &room);
        Some(room)
    }

    /// Detaches a connection only if it is attached to `room`. Returns
    /// `true` if it was.
    pub async fn detach_from(&self, id: ConnectionId, room: &RoomId) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.connections.get_mut(&id) else {
            return false;
        };
        if entry.room.as_ref() != Some(room) {
            return false;
        }
        entry.room = None;
        inner.unindex_room(id, room);
        true
    }

    /// Queues a message for one connection. Returns `true` if queued.
    pub async fn send_to(&self, id: ConnectionId, msg: ServerMessage) -> bool {
        let outlet = self.lock().outlet(id);
        outlet.is_some_and(|o| o.deliver(&Arc::new(msg)))
    }

    /// Queues a message for every connection attached to `room`, except
    /// `exclude`. Returns how many connections it was queued for.
    pub async fn broadcast(
        &self,
        room: &RoomId,
        msg: ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let targets: Vec<Arc<Outlet>> = {
            let inner = self.lock();
            let Some(members) = inner.rooms.get(room) else {
                return 0;
            };
            members
                .iter()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| inner.outlet(*id))
                .collect()
        };
        let msg = Arc::new(msg);
        targets.iter().filter(|o| o.deliver(&msg)).count()
    }

    /// Records inbound activity on a connection.
    pub async fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.lock().connections.get_mut(&id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Returns a copy of a connection's entry.
    pub async fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let inner = self.lock();
        inner.connections.get(&id).map(|e| ConnectionInfo {
            id,
            user_id: e.outlet.user_id.clone(),
            room: e.room.clone(),
            last_seen: e.last_seen,
        })
    }

    /// The live connection of a user, if any.
    pub async fn connection_of(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.lock().by_user.get(user_id).copied()
    }

    /// Connections attached to `room`, in id order.
    pub async fn room_connections(&self, room: &RoomId) -> Vec<ConnectionId> {
        let inner = self.lock();
        inner
            .rooms
            .get(room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Asks every connection to close. Returns how many were notified.
    pub async fn close_all(&self) -> usize {
        let inner = self.lock();
        for entry in inner.connections.values() {
            entry.outlet.kick.notify_one();
        }
        inner.connections.len()
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.lock().connections.len()
    }

    /// Returns `true` if no connections are registered.
    pub async fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }
}
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn cid(n: u64) -> ConnectionId {
        ConnectionId::new(n)
    }

    fn user(name: &str) -> UserId {
        UserId::new(name)
    }

    fn room(name: &str) -> RoomId {
        RoomId::parse(name).unwrap()
    }

    async fn registered(
        reg: &ConnectionRegistry,
        n: u64,
        name: &str,
        capacity: usize,
    ) -> (mpsc::Receiver<Outbound>, Registration) {
        let (tx, rx) = mpsc::channel(capacity);
        let registration = reg.register(cid(n), user(name), tx).await;
        (rx, registration)
    }

    // =====================================================================
    // register() / deregister()
    // =====================================================================

    #[tokio::test]
    async fn test_register_then_get_returns_identity() {
        let reg = ConnectionRegistry::new();
        let (_rx, r) = registered(&reg, 1, "alice", 8).await;
        assert!(r.replaced.is_none());

        let info = reg.get(cid(1)).await.expect("registered");
        assert_eq!(info.user_id, user("alice"));
        assert_eq!(info.room, None);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn test_deregister_twice_is_idempotent() {
        let reg = ConnectionRegistry::new();
        let (_rx, _r) = registered(&reg, 1, "alice", 8).await;
        reg.attach(cid(1), room("t")).await.unwrap();

        let first = reg.deregister(cid(1)).await.expect("first removes");
        assert_eq!(first.room, Some(room("t")));
        assert!(reg.deregister(cid(1)).await.is_none());
        assert!(reg.is_empty().await);
        assert!(reg.room_connections(&room("t")).await.is_empty());
    }

    #[tokio::test]
    async fn test_register_same_user_replaces_old_connection() {
        let reg = ConnectionRegistry::new();
        let (mut old_rx, old) = registered(&reg, 1, "alice", 8).await;
        reg.attach(cid(1), room("t")).await.unwrap();

        let (_rx, new) = registered(&reg, 2, "alice", 8).await;

        let departure = new.replaced.expect("old connection displaced");
        assert_eq!(departure.connection_id, cid(1));
        assert_eq!(departure.room, Some(room("t")));
        assert!(reg.get(cid(1)).await.is_none());
        assert_eq!(reg.connection_of(&user("alice")).await, Some(cid(2)));

        let notice = old_rx.recv().await.expect("notice queued");
        assert!(matches!(
            &*notice,
            ServerMessage::Error { code: ErrorCode::SessionReplaced, .. }
        ));
        tokio::time::timeout(Duration::from_secs(1), old.kick.notified())
            .await
            .expect("old connection kicked");
    }

    // =====================================================================
    // attach() / detach()
    // =====================================================================

    #[tokio::test]
    async fn test_attach_moves_connection_between_rooms() {
        let reg = ConnectionRegistry::new();
        let (_rx, _r) = registered(&reg, 1, "alice", 8).await;

        assert_eq!(reg.attach(cid(1), room("a")).await.unwrap(), None);
        assert_eq!(reg.attach(cid(1), room("a")).await.unwrap(), None);
        assert_eq!(reg.attach(cid(1), room("b")).await.unwrap(), Some(room("a")));

        assert!(reg.room_connections(&room("a")).await.is_empty());
        assert_eq!(reg.room_connections(&room("b")).await, vec![cid(1)]);
    }

    #[tokio::test]
    async fn test_attach_unknown_connection_returns_not_found() {
        let reg = ConnectionRegistry::new();
        let result = reg.attach(cid(9), room("a")).await;
        assert!(matches!(result, Err(SessionError::NotFound(id)) if id == cid(9)));
    }

    #[tokio::test]
    async fn test_detach_returns_room_once() {
        let reg = ConnectionRegistry::new();
        let (_rx, _r) = registered(&reg, 1, "alice", 8).await;
        reg.attach(cid(1), room("a")).await.unwrap();

        assert_eq!(reg.detach(cid(1)).await, Some(room("a")));
        assert_eq!(reg.detach(cid(1)).await, None);
    }

    #[tokio::test]
    async fn test_detach_from_ignores_other_room() {
        let reg = ConnectionRegistry::new();
        let (_rx, _r) = registered(&reg, 1, "alice", 8).await;
        reg.attach(cid(1), room("b")).await.unwrap();

        assert!(!reg.detach_from(cid(1), &room("a")).await);
        assert_eq!(reg.room_connections(&room("b")).await, vec![cid(1)]);

        assert!(reg.detach_from(cid(1), &room("b")).await);
        assert_eq!(reg.get(cid(1)).await.unwrap().room, None);
        assert!(!reg.detach_from(cid(9), &room("b")).await);
    }

    // =====================================================================
    // broadcast()
    // =====================================================================

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_other_rooms() {
        let reg = ConnectionRegistry::new();
        let (mut a, _ra) = registered(&reg, 1, "alice", 8).await;
        let (mut b, _rb) = registered(&reg, 2, "bob", 8).await;
        let (mut c, _rc) = registered(&reg, 3, "carol", 8).await;
        reg.attach(cid(1), room("t")).await.unwrap();
        reg.attach(cid(2), room("t")).await.unwrap();
        reg.attach(cid(3), room("other")).await.unwrap();

        let delivered = reg.broadcast(&room("t"), ServerMessage::Pong, Some(cid(1))).await;

        assert_eq!(delivered, 1);
        assert_eq!(*b.recv().await.unwrap(), ServerMessage::Pong);
        assert!(a.try_recv().is_err());
        assert!(c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_peer_and_continues() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = registered(&reg, 1, "alice", 8).await;
        let (mut b, _rb) = registered(&reg, 2, "bob", 8).await;
        reg.attach(cid(1), room("t")).await.unwrap();
        reg.attach(cid(2), room("t")).await.unwrap();
        drop(a); // alice's writer is gone

        let delivered = reg.broadcast(&room("t"), ServerMessage::Pong, None).await;

        assert_eq!(delivered, 1);
        assert!(b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_full_queue_kicks_slow_peer() {
        let reg = ConnectionRegistry::new();
        let (_slow_rx, slow) = registered(&reg, 1, "slow", 1).await;
        let (mut fast, _rf) = registered(&reg, 2, "fast", 8).await;
        reg.attach(cid(1), room("t")).await.unwrap();
        reg.attach(cid(2), room("t")).await.unwrap();

        assert_eq!(reg.broadcast(&room("t"), ServerMessage::Pong, None).await, 2);
        // slow's single slot is still occupied
        assert_eq!(reg.broadcast(&room("t"), ServerMessage::Pong, None).await, 1);

        tokio::time::timeout(Duration::from_secs(1), slow.kick.notified())
            .await
            .expect("slow peer kicked");
        assert!(fast.recv().await.is_some());
        assert!(fast.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_unknown_room_delivers_nothing() {
        let reg = ConnectionRegistry::new();
        assert_eq!(reg.broadcast(&room("empty"), ServerMessage::Pong, None).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_broadcasts_in_separate_rooms() {
        let reg = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for n in 0..8 {
            let (rx, _r) = registered(&reg, n, &format!("user{n}"), 512).await;
            reg.attach(cid(n), room(&format!("room{n}"))).await.unwrap();
            receivers.push(rx);
        }

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..8 {
            let reg = reg.clone();
            tasks.spawn(async move {
                let target = room(&format!("room{n}"));
                let mut delivered = 0;
                for _ in 0..200 {
                    delivered += reg.broadcast(&target, ServerMessage::Pong, None).await;
                }
                delivered
            });
        }
        while let Some(delivered) = tasks.join_next().await {
            assert_eq!(delivered.unwrap(), 200);
        }

        for mut rx in receivers {
            let mut count = 0;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            assert_eq!(count, 200);
        }
    }

    #[tokio::test]
    async fn test_registry_usable_after_poisoned_lock() {
        let reg = ConnectionRegistry::new();
        let (mut rx, _r) = registered(&reg, 1, "alice", 8).await;
        reg.attach(cid(1), room("t")).await.unwrap();

        fn panic_holding(lock: &Mutex<Inner>) {
            let _guard = lock.lock().unwrap();
            panic!("poison the registry lock");
        }
        let inner = Arc::clone(&reg.inner);
        let holder = std::thread::spawn(move || panic_holding(&inner));
        assert!(holder.join().is_err());
        assert!(reg.inner.is_poisoned());

        assert_eq!(reg.broadcast(&room("t"), ServerMessage::Pong, None).await, 1);
        assert_eq!(*rx.recv().await.unwrap(), ServerMessage::Pong);
        assert!(reg.deregister(cid(1)).await.is_some());
    }

    // =====================================================================
    // touch() / close_all()
    // =====================================================================

    #[tokio::test]
    async fn test_touch_advances_last_seen() {
        let reg = ConnectionRegistry::new();
        let (_rx, _r) = registered(&reg, 1, "alice", 8).await;
        let before = reg.get(cid(1)).await.unwrap().last_seen;
        tokio::time::sleep(Duration::from_millis(5)).await;

        reg.touch(cid(1)).await;

        assert!(reg.get(cid(1)).await.unwrap().last_seen > before);
    }

    #[tokio::test]
    async fn test_close_all_notifies_every_connection() {
        let reg = ConnectionRegistry::new();
        let (_a, ra) = registered(&reg, 1, "alice", 8).await;
        let (_b, rb) = registered(&reg, 2, "bob", 8).await;

        assert_eq!(reg.close_all().await, 2);

        ra.kick.notified().await;
        rb.kick.notified().await;
    }
}
