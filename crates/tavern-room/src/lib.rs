//! Rooms for Tavern.
//!
//! Each room runs as an isolated Tokio task (actor model) that owns its
//! table state, members, and version counter. Actions reach a room through
//! its command channel and are applied one at a time.
//!
//! # Key types
//!
//! - [`RoomStore`]: finds or creates rooms, routes joins, leaves, and
//!   actions, evicts idle rooms, drains on shutdown
//! - [`RoomHandle`]: send commands to one running room actor
//! - [`Room`]: the in-memory state a room actor owns
//! - [`sync`]: action validation and delta computation
//! - [`chat`]: the bounded, unversioned chat history
//! - [`RoomConfig`] / [`RoomState`]: settings and lifecycle

pub mod chat;
mod config;
mod error;
mod room;
mod state;
mod store;
pub mod sync;

pub use chat::ChatRejection;
pub use config::{RoomConfig, RoomState};
pub use error::RoomError;
pub use room::{JoinOutcome, RoomHandle, RoomInfo};
pub use state::Room;
pub use store::RoomStore;
pub use sync::ActionRejection;
