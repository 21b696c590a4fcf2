//! The state synchronizer: validates actions and turns them into deltas.
//!
//! Everything here is synchronous and touches only the [`Room`] passed in,
//! so the room actor can call it without any I/O on the mutation path.
//!
//! # Actions
//!
//! | type              | payload                        | change                     |
//! |-------------------|--------------------------------|----------------------------|
//! | `addCharacter`    | `{name, ...attributes}`        | `c<N>` add                 |
//! | `updateCharacter` | `{entity, attributes}`         | entity update (merge)      |
//! | `removeCharacter` | `{entity}`                     | entity remove              |
//! | `setScene`        | `{...attributes}`              | `scene` set                |
//! | `claimTurn`       | `{}`                           | `turn` set `{holder}`      |
//! | `endTurn`         | `{}`                           | `turn` remove              |
//!
//! While a current member holds the turn, only they may change characters
//! or the scene. A turn held by someone who has left can be claimed.

use serde_json::Value;
use tavern_protocol::{
    Action, Attributes, Change, ChangeOp, Delta, LoggedAction, UserId, character_number,
};

use crate::Room;

/// Entity key of the scene.
pub const SCENE: &str = "scene";
/// Entity key of the turn pointer.
pub const TURN: &str = "turn";
/// Longest accepted character name, in characters.
pub const MAX_NAME_LEN: usize = 64;

/// Why an action was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionRejection {
    #[error("user {0} is not a member of this room")]
    NotMember(UserId),

    #[error("unknown action type {0:?}")]
    UnknownType(String),

    #[error("invalid payload: {0}")]
    BadPayload(String),

    #[error("no character {0:?}")]
    NoSuchEntity(String),

    #[error("it is {0}'s turn")]
    NotYourTurn(UserId),

    #[error("the turn is held by {0}")]
    TurnTaken(UserId),

    #[error("you do not hold the turn")]
    TurnNotHeld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionKind {
    AddCharacter,
    UpdateCharacter,
    RemoveCharacter,
    SetScene,
    ClaimTurn,
    EndTurn,
}

impl ActionKind {
    fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "addCharacter" => Self::AddCharacter,
            "updateCharacter" => Self::UpdateCharacter,
            "removeCharacter" => Self::RemoveCharacter,
            "setScene" => Self::SetScene,
            "claimTurn" => Self::ClaimTurn,
            "endTurn" => Self::EndTurn,
            _ => return None,
        })
    }

    /// Actions that change the table and so respect the turn.
    fn is_turn_gated(self) -> bool {
        !matches!(self, Self::ClaimTurn | Self::EndTurn)
    }
}

/// Checks whether `action` is legal in `room` right now.
///
/// # Errors
/// The first rule the action breaks.
pub fn validate(room: &Room, action: &Action) -> Result<(), ActionRejection> {
    plan(room, action).map(|_| ())
}

/// Validates and applies `action`, advancing the version by exactly one.
///
/// On success the action is in the room's log and the returned delta
/// describes the change. On error the room is untouched.
pub fn apply(room: &mut Room, action: Action) -> Result<Delta, ActionRejection> {
    let change = plan(room, &action)?;

    let from_version = room.version;
    let to_version = from_version + 1;
    room.state.apply_change(&change);
    room.version = to_version;
    if let Some(n) = character_number(&change.entity) {
        room.next_character = room.next_character.max(n + 1);
    }
    room.record(LoggedAction {
        seq: to_version,
        action: action.clone(),
    });

    Ok(Delta {
        room_id: room.id.clone(),
        from_version,
        to_version,
        change,
        action,
    })
}

/// Computes the change `action` would make, without making it.
fn plan(room: &Room, action: &Action) -> Result<Change, ActionRejection> {
    let user = &action.user_id;
    if !room.is_member(user) {
        return Err(ActionRejection::NotMember(user.clone()));
    }
    let kind = ActionKind::parse(&action.kind)
        .ok_or_else(|| ActionRejection::UnknownType(action.kind.clone()))?;
    let payload = payload_object(&action.payload)?;
    let holder = active_turn_holder(room);

    if kind.is_turn_gated() {
        if let Some(holder) = holder.filter(|h| *h != user) {
            return Err(ActionRejection::NotYourTurn(holder.clone()));
        }
    }

    match kind {
        ActionKind::AddCharacter => {
            check_name(payload.get("name"), true)?;
            Ok(Change {
                entity: format!("c{}", room.next_character),
                op: ChangeOp::Add,
                value: Some(payload),
            })
        }
        ActionKind::UpdateCharacter => {
            let entity = existing_character(room, &payload)?;
            let attributes = match payload.get("attributes") {
                Some(Value::Object(map)) if !map.is_empty() => map.clone(),
                _ => {
                    return Err(ActionRejection::BadPayload(
                        "attributes must be a non-empty object".into(),
                    ));
                }
            };
            check_name(attributes.get("name"), false)?;
            Ok(Change {
                entity,
                op: ChangeOp::Update,
                value: Some(attributes),
            })
        }
        ActionKind::RemoveCharacter => Ok(Change {
            entity: existing_character(room, &payload)?,
            op: ChangeOp::Remove,
            value: None,
        }),
        ActionKind::SetScene => {
            if payload.is_empty() {
                return Err(ActionRejection::BadPayload("scene needs at least one attribute".into()));
            }
            Ok(Change {
                entity: SCENE.into(),
                op: ChangeOp::Set,
                value: Some(payload),
            })
        }
        ActionKind::ClaimTurn => {
            if let Some(holder) = holder {
                return Err(ActionRejection::TurnTaken(holder.clone()));
            }
            let mut value = Attributes::new();
            value.insert("holder".into(), Value::String(user.as_str().to_owned()));
            Ok(Change {
                entity: TURN.into(),
                op: ChangeOp::Set,
                value: Some(value),
            })
        }
        ActionKind::EndTurn => {
            if holder != Some(user) {
                return Err(ActionRejection::TurnNotHeld);
            }
            Ok(Change {
                entity: TURN.into(),
                op: ChangeOp::Remove,
                value: None,
            })
        }
    }
}

/// `null` counts as `{}`; anything else must be an object.
fn payload_object(payload: &Value) -> Result<Attributes, ActionRejection> {
    match payload {
        Value::Null => Ok(Attributes::new()),
        Value::Object(map) => Ok(map.clone()),
        _ => Err(ActionRejection::BadPayload("payload must be an object".into())),
    }
}

/// The member currently holding the turn. A holder who has left the room
/// no longer counts.
fn active_turn_holder(room: &Room) -> Option<&UserId> {
    let holder = room.state.get(TURN)?.get("holder")?.as_str()?;
    room.members.iter().find(|m| m.as_str() == holder)
}

fn check_name(name: Option<&Value>, required: bool) -> Result<(), ActionRejection> {
    match name {
        None if !required => Ok(()),
        Some(Value::String(s)) if !s.trim().is_empty() && s.chars().count() <= MAX_NAME_LEN => {
            Ok(())
        }
        _ => Err(ActionRejection::BadPayload(format!(
            "name must be a non-empty string of at most {MAX_NAME_LEN} characters"
        ))),
    }
}

fn existing_character(room: &Room, payload: &Attributes) -> Result<String, ActionRejection> {
    let entity = payload
        .get("entity")
        .and_then(Value::as_str)
        .ok_or_else(|| ActionRejection::BadPayload("entity must be a string".into()))?;
    if character_number(entity).is_none() || !room.state.contains(entity) {
        return Err(ActionRejection::NoSuchEntity(entity.to_owned()));
    }
    Ok(entity.to_owned())
}
