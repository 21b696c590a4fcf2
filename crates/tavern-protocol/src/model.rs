//! The room data model: table state, actions, deltas, and snapshots.
//!
//! These types are shared by the room actor (which produces them), the
//! persistence bridge (which stores them), and the wire messages (which
//! carry parts of them to clients).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{RoomId, UserId};

/// Free-form attributes of one table entity (`{"name":"Raen","hp":12}`).
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// The shared table: entity id → attributes.
///
/// Character entities are keyed `c1`, `c2`, ...; `scene` and `turn` are
/// reserved keys. A `BTreeMap` keeps snapshots deterministic on the wire
/// and on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableState(BTreeMap<String, Attributes>);

impl TableState {
    /// Returns the attributes of an entity, if present.
    pub fn get(&self, entity: &str) -> Option<&Attributes> {
        self.0.get(entity)
    }

    /// Returns `true` if the entity exists.
    pub fn contains(&self, entity: &str) -> bool {
        self.0.contains_key(entity)
    }

    /// Inserts or replaces an entity.
    pub fn insert(&mut self, entity: impl Into<String>, attributes: Attributes) {
        self.0.insert(entity.into(), attributes);
    }

    /// Removes an entity, returning its attributes.
    pub fn remove(&mut self, entity: &str) -> Option<Attributes> {
        self.0.remove(entity)
    }

    /// Iterates entities in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Attributes)> {
        self.0.iter()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the table holds no entities.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Applies a [`Change`] to the table.
    ///
    /// - `add` and `set` replace the entity with `value`.
    /// - `update` merges `value` key-by-key into the existing attributes,
    ///   creating the entity if it is missing.
    /// - `remove` drops the entity.
    ///
    /// Replay relies on this being the only way state moves forward, so the
    /// same sequence of changes always yields the same table.
    pub fn apply_change(&mut self, change: &Change) {
        match change.op {
            ChangeOp::Add | ChangeOp::Set => {
                let value = change.value.clone().unwrap_or_default();
                self.0.insert(change.entity.clone(), value);
            }
            ChangeOp::Update => {
                let entry = self.0.entry(change.entity.clone()).or_default();
                if let Some(value) = &change.value {
                    for (key, v) in value {
                        entry.insert(key.clone(), v.clone());
                    }
                }
            }
            ChangeOp::Remove => {
                self.0.remove(&change.entity);
            }
        }
    }
}

/// What a [`Change`] does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Add,
    Update,
    Remove,
    Set,
}

/// The minimal description of one state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// The entity key that changed.
    pub entity: String,
    pub op: ChangeOp,
    /// New attributes for `add`/`set`, the merged keys for `update`,
    /// absent for `remove`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Attributes>,
}

/// A client request to change room state, stamped with the issuing user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub room_id: RoomId,
    pub user_id: UserId,
    /// The action type, e.g. `"addCharacter"`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The record of one accepted action: the version step, what changed, and
/// the action that caused it.
///
/// `to_version` is always `from_version + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub room_id: RoomId,
    pub from_version: u64,
    pub to_version: u64,
    pub change: Change,
    pub action: Action,
}

/// Full room state at a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub room_id: RoomId,
    pub version: u64,
    pub state: TableState,
    /// The counter used to mint the next character id. Persisted so that a
    /// rehydrated room never reuses an id.
    #[serde(default)]
    pub next_character: u64,
}

impl Snapshot {
    /// The state of a room nobody has touched yet.
    pub fn empty(room_id: RoomId) -> Self {
        Self {
            room_id,
            version: 0,
            state: TableState::default(),
            next_character: 1,
        }
    }

    /// Applies a delta on top of this snapshot.
    ///
    /// The caller checks `delta.from_version == self.version`; this only
    /// advances the state.
    pub fn apply(&mut self, delta: &Delta) {
        self.state.apply_change(&delta.change);
        self.version = delta.to_version;
        if let Some(n) = character_number(&delta.change.entity) {
            self.next_character = self.next_character.max(n + 1);
        }
    }
}

/// One entry of a room's in-memory action log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedAction {
    /// The version this action produced.
    pub seq: u64,
    pub action: Action,
}

/// Whether a chat line came from a member or from the room itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Text,
    /// Join and leave notices. These carry no `userId`.
    System,
}

/// One line of room chat.
///
/// Chat is not part of the table state: it has its own sequence and never
/// moves the room version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    /// Per-room sequence, starting at 1.
    pub seq: u64,
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub sent_at: u64,
}

/// Parses the number out of a character entity id (`"c12"` → `12`).
pub fn character_number(entity: &str) -> Option<u64> {
    entity.strip_prefix('c')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: serde_json::Value) -> Attributes {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn change(entity: &str, op: ChangeOp, value: Option<serde_json::Value>) -> Change {
        Change {
            entity: entity.into(),
            op,
            value: value.map(attrs),
        }
    }

    #[test]
    fn test_update_merges_attributes() {
        let mut table = TableState::default();
        table.apply_change(&change("c1", ChangeOp::Add, Some(json!({"name": "Raen", "hp": 10}))));
        table.apply_change(&change("c1", ChangeOp::Update, Some(json!({"hp": 7}))));

        let c1 = table.get("c1").unwrap();
        assert_eq!(c1["name"], json!("Raen"));
        assert_eq!(c1["hp"], json!(7));
    }

    #[test]
    fn test_set_replaces_and_remove_drops() {
        let mut table = TableState::default();
        table.apply_change(&change("scene", ChangeOp::Set, Some(json!({"map": "cave"}))));
        table.apply_change(&change("scene", ChangeOp::Set, Some(json!({"weather": "rain"}))));
        assert_eq!(table.get("scene").unwrap().len(), 1);

        table.apply_change(&change("scene", ChangeOp::Remove, None));
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_serializes_as_plain_object() {
        let mut table = TableState::default();
        table.insert("c1", attrs(json!({"name": "Raen"})));
        assert_eq!(
            serde_json::to_value(&table).unwrap(),
            json!({"c1": {"name": "Raen"}})
        );
    }

    #[test]
    fn test_snapshot_apply_advances_version_and_counter() {
        let room = RoomId::parse("t").unwrap();
        let mut snap = Snapshot::empty(room.clone());
        let delta = Delta {
            room_id: room.clone(),
            from_version: 0,
            to_version: 1,
            change: change("c4", ChangeOp::Add, Some(json!({"name": "x"}))),
            action: Action {
                room_id: room,
                user_id: UserId::new("u"),
                kind: "addCharacter".into(),
                payload: json!({"name": "x"}),
            },
        };
        snap.apply(&delta);
        assert_eq!(snap.version, 1);
        assert_eq!(snap.next_character, 5);
        assert!(snap.state.contains("c4"));
    }

    #[test]
    fn test_system_chat_entry_omits_user() {
        let entry = ChatEntry {
            seq: 3,
            kind: ChatKind::System,
            user_id: None,
            text: "v has joined.".into(),
            sent_at: 1_700_000_000_000,
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"seq": 3, "kind": "system", "text": "v has joined.", "sentAt": 1_700_000_000_000u64})
        );
    }

    #[test]
    fn test_character_number() {
        assert_eq!(character_number("c12"), Some(12));
        assert_eq!(character_number("scene"), None);
        assert_eq!(character_number("c"), None);
    }
}
