//! Identity types and the messages that travel on the wire.
//!
//! Every frame is one JSON object with a `"type"` tag. Field names are
//! camelCase on the wire (`roomId`, `fromVersion`) while the Rust side keeps
//! snake_case; serde's `rename_all_fields` does the translation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Change, ChatEntry, Delta, ProtocolError, Snapshot, TableState};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// The identity of an authenticated user.
///
/// Produced only by the external identity verifier (the JWT `sub`, an
/// OAuth2 account id, ...). The engine compares user ids but never parses
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps a verified user identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identifier of a room (one tabletop session).
///
/// Chosen by clients (`"table-1"`), so it is validated on the way in:
/// 1–64 characters from `[A-Za-z0-9_-]`. The restriction also makes a room
/// id safe to use as a storage key or a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Longest accepted room identifier.
    pub const MAX_LEN: usize = 64;

    /// Validates and wraps a room identifier.
    pub fn parse(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= Self::MAX_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(id))
        } else {
            Err(ProtocolError::InvalidRoomId(id))
        }
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Stable machine-readable codes carried by `{"type":"error"}` frames.
///
/// Clients branch on these, so variants are never renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The token was missing, rejected, or expired. The connection closes.
    AuthenticationFailure,
    /// The action was rejected by validation. The sender stays joined.
    InvalidAction,
    /// The room could not be resolved.
    RoomNotFound,
    /// The request needs the connection to be joined to that room.
    NotJoined,
    /// The room has reached its member limit.
    RoomFull,
    /// The frame could not be decoded or is not valid in this state.
    BadRequest,
    /// Durable storage could not load the room.
    StorageUnavailable,
    /// The same user authenticated on another connection.
    SessionReplaced,
    /// Authentication, join, or the idle window ran out.
    Timeout,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// The action part of an `action` frame: `{"type":"addCharacter","payload":{...}}`.
///
/// The type tag is kept as a string so that an unrecognized action is a
/// validation failure (`InvalidAction`) rather than a decode failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// The action type tag, e.g. `"addCharacter"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload; absent means `{}`.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// First frame on every connection: the opaque identity token.
    Auth { token: String },
    /// Join (or re-join) a room and receive its snapshot.
    Join { room_id: RoomId },
    /// Leave the current room. `roomId`, when present, must match it.
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },
    /// Submit an action to the joined room.
    Action {
        room_id: RoomId,
        payload: ActionRequest,
    },
    /// Ask for the user ids currently joined to the room.
    Members { room_id: RoomId },
    /// Post a chat line to the joined room.
    Chat { room_id: RoomId, text: String },
    /// Ask for the room's recent chat, oldest first. `limit` caps how many
    /// of the newest lines come back.
    ChatHistory {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    /// Keep-alive.
    Ping,
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// Whether a presence notification announces an arrival or a departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceEvent {
    /// The user joined the room.
    Joined,
    /// The user left the room or disconnected.
    Left,
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Authentication succeeded.
    Authenticated { user_id: UserId },
    /// Full room state; always the first room frame after a join.
    Snapshot {
        room_id: RoomId,
        version: u64,
        state: TableState,
    },
    /// The effect of one accepted action.
    Delta {
        room_id: RoomId,
        from_version: u64,
        to_version: u64,
        change: Change,
    },
    /// A request failed. Only ever sent to the requesting connection.
    Error { code: ErrorCode, message: String },
    /// Another member arrived or departed.
    Presence {
        room_id: RoomId,
        user_id: UserId,
        event: PresenceEvent,
    },
    /// Answer to a `members` request, sorted by user id.
    Members { room_id: RoomId, users: Vec<UserId> },
    /// Acknowledges an explicit `leave`.
    Left { room_id: RoomId },
    /// A chat line, sent to every member including its author.
    ChatMessage { room_id: RoomId, message: ChatEntry },
    /// Answer to `chatHistory`.
    ChatHistory {
        room_id: RoomId,
        messages: Vec<ChatEntry>,
    },
    /// Answer to `ping`.
    Pong,
}

impl ServerMessage {
    /// Builds an `error` frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Builds the `snapshot` frame for a room snapshot.
    pub fn snapshot(snapshot: &Snapshot) -> Self {
        Self::Snapshot {
            room_id: snapshot.room_id.clone(),
            version: snapshot.version,
            state: snapshot.state.clone(),
        }
    }

    /// Builds the `delta` frame broadcast for an accepted action.
    pub fn delta(delta: &Delta) -> Self {
        Self::Delta {
            room_id: delta.room_id.clone(),
            from_version: delta.from_version,
            to_version: delta.to_version,
            change: delta.change.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeOp, ChatKind};
    use serde_json::json;

    fn room(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    #[test]
    fn test_room_id_accepts_slug() {
        assert_eq!(room("table-1").as_str(), "table-1");
        assert!(RoomId::parse("a_B-9").is_ok());
    }

    #[test]
    fn test_room_id_rejects_empty_long_and_path_like() {
        assert!(RoomId::parse("").is_err());
        assert!(RoomId::parse("x".repeat(65)).is_err());
        assert!(RoomId::parse("../etc").is_err());
        assert!(RoomId::parse("two words").is_err());
    }

    #[test]
    fn test_room_id_deserialize_validates() {
        let bad: Result<RoomId, _> = serde_json::from_str("\"a/b\"");
        assert!(bad.is_err());
        let good: RoomId = serde_json::from_str("\"table-1\"").unwrap();
        assert_eq!(good, room("table-1"));
    }

    #[test]
    fn test_client_join_wire_format() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "join", "roomId": "table-1"})).unwrap();
        assert_eq!(msg, ClientMessage::Join { room_id: room("table-1") });
    }

    #[test]
    fn test_client_action_wire_format() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "action",
            "roomId": "table-1",
            "payload": {"type": "addCharacter", "payload": {"name": "Raen"}}
        }))
        .unwrap();
        match msg {
            ClientMessage::Action { room_id, payload } => {
                assert_eq!(room_id, room("table-1"));
                assert_eq!(payload.kind, "addCharacter");
                assert_eq!(payload.payload, json!({"name": "Raen"}));
            }
            other => panic!("expected Action, got {other:?}"),
        }
    }

    #[test]
    fn test_client_action_payload_defaults_to_null() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "action",
            "roomId": "t",
            "payload": {"type": "claimTurn"}
        }))
        .unwrap();
        match msg {
            ClientMessage::Action { payload, .. } => assert!(payload.payload.is_null()),
            other => panic!("expected Action, got {other:?}"),
        }
    }

    #[test]
    fn test_client_leave_room_id_is_optional() {
        let msg: ClientMessage = serde_json::from_value(json!({"type": "leave"})).unwrap();
        assert_eq!(msg, ClientMessage::Leave { room_id: None });
    }

    #[test]
    fn test_client_ping_is_tag_only() {
        let msg: ClientMessage = serde_json::from_value(json!({"type": "ping"})).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn test_server_snapshot_wire_format() {
        let msg = ServerMessage::Snapshot {
            room_id: room("table-1"),
            version: 0,
            state: TableState::default(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "snapshot", "roomId": "table-1", "version": 0, "state": {}})
        );
    }

    #[test]
    fn test_server_delta_wire_format() {
        let msg = ServerMessage::Delta {
            room_id: room("table-1"),
            from_version: 0,
            to_version: 1,
            change: Change {
                entity: "c1".into(),
                op: ChangeOp::Add,
                value: None,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "delta",
                "roomId": "table-1",
                "fromVersion": 0,
                "toVersion": 1,
                "change": {"entity": "c1", "op": "add"}
            })
        );
    }

    #[test]
    fn test_server_error_wire_format() {
        let value =
            serde_json::to_value(ServerMessage::error(ErrorCode::InvalidAction, "no such entity"))
                .unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "code": "InvalidAction", "message": "no such entity"})
        );
    }

    #[test]
    fn test_server_presence_wire_format() {
        let value = serde_json::to_value(ServerMessage::Presence {
            room_id: room("t"),
            user_id: UserId::new("v"),
            event: PresenceEvent::Joined,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "presence", "roomId": "t", "userId": "v", "event": "joined"})
        );
    }

    #[test]
    fn test_client_chat_wire_format() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "chat", "roomId": "t", "text": "hello"})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Chat {
                room_id: room("t"),
                text: "hello".into()
            }
        );
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "chatHistory", "roomId": "t"})).unwrap();
        assert_eq!(msg, ClientMessage::ChatHistory { room_id: room("t"), limit: None });
    }

    #[test]
    fn test_server_chat_message_wire_format() {
        let value = serde_json::to_value(ServerMessage::ChatMessage {
            room_id: room("t"),
            message: ChatEntry {
                seq: 1,
                kind: ChatKind::Text,
                user_id: Some(UserId::new("u")),
                text: "hi".into(),
                sent_at: 5,
            },
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "chatMessage",
                "roomId": "t",
                "message": {"seq": 1, "kind": "text", "userId": "u", "text": "hi", "sentAt": 5}
            })
        );
    }

    #[test]
    fn test_server_pong_is_tag_only() {
        assert_eq!(
            serde_json::to_value(ServerMessage::Pong).unwrap(),
            json!({"type": "pong"})
        );
    }

    #[test]
    fn test_error_code_display_matches_wire() {
        assert_eq!(ErrorCode::SessionReplaced.to_string(), "SessionReplaced");
    }
}
