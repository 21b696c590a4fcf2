//! Wire protocol and room data model for Tavern.
//!
//! This crate defines what clients and the server say to each other and
//! what a room's state looks like:
//!
//! - **Messages** ([`ClientMessage`], [`ServerMessage`], [`ErrorCode`]):
//!   the frames that travel on the wire.
//! - **Model** ([`TableState`], [`Action`], [`Delta`], [`Snapshot`]):
//!   room state and its transitions, shared with storage. [`ChatEntry`]
//!   is the one unversioned record.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how frames become bytes.
//!
//! It knows nothing about connections or rooms as running things; it only
//! describes data.
//!
//! ```text
//! Transport (bytes) → Protocol (messages) → Session / Room
//! ```

mod codec;
mod error;
mod model;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use model::{
    Action, Attributes, Change, ChangeOp, ChatEntry, ChatKind, Delta, LoggedAction, Snapshot,
    TableState, character_number,
};
pub use types::{
    ActionRequest, ClientMessage, ErrorCode, PresenceEvent, RoomId, ServerMessage, UserId,
};
