//! The in-memory room: table state, members, version, and recent actions.

use std::collections::{BTreeSet, VecDeque};

use tavern_protocol::{Delta, LoggedAction, RoomId, Snapshot, TableState, UserId};

/// One active tabletop session.
///
/// Owned by its room actor; nothing else holds a `&mut Room`. Mutations go
/// through [`sync::apply`](crate::sync::apply) (state) and the actor's
/// join/leave handling (members).
#[derive(Debug, Clone)]
pub struct Room {
    pub(crate) id: RoomId,
    pub(crate) version: u64,
    pub(crate) state: TableState,
    pub(crate) members: BTreeSet<UserId>,
    pub(crate) log: VecDeque<LoggedAction>,
    pub(crate) log_capacity: usize,
    pub(crate) next_character: u64,
}

impl Room {
    /// An empty room at version 0.
    pub fn new(id: RoomId, log_capacity: usize) -> Self {
        Self::from_snapshot(Snapshot::empty(id), Vec::new(), log_capacity)
    }

    /// Rebuilds a room from storage. `replayed` are the deltas already
    /// folded into `snapshot`; their actions seed the log.
    pub fn from_snapshot(snapshot: Snapshot, replayed: Vec<Delta>, log_capacity: usize) -> Self {
        let mut room = Self {
            id: snapshot.room_id,
            version: snapshot.version,
            state: snapshot.state,
            members: BTreeSet::new(),
            log: VecDeque::new(),
            log_capacity: log_capacity.max(1),
            next_character: snapshot.next_character.max(1),
        };
        for delta in replayed {
            room.record(LoggedAction {
                seq: delta.to_version,
                action: delta.action,
            });
        }
        room
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &TableState {
        &self.state
    }

    /// Members in user id order.
    pub fn members(&self) -> &BTreeSet<UserId> {
        &self.members
    }

    pub fn is_member(&self, user_id: &UserId) -> bool {
        self.members.contains(user_id)
    }

    /// The most recent accepted actions, oldest first.
    pub fn log(&self) -> impl Iterator<Item = &LoggedAction> {
        self.log.iter()
    }

    /// A copy of the current state for clients and storage.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            room_id: self.id.clone(),
            version: self.version,
            state: self.state.clone(),
            next_character: self.next_character,
        }
    }

    /// Adds a member. Returns `false` if they were already one.
    pub(crate) fn add_member(&mut self, user_id: UserId) -> bool {
        self.members.insert(user_id)
    }

    /// Removes a member. Returns `false` if they weren't one.
    pub(crate) fn remove_member(&mut self, user_id: &UserId) -> bool {
        self.members.remove(user_id)
    }

    pub(crate) fn record(&mut self, entry: LoggedAction) {
        if self.log.len() == self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(entry);
    }
}
