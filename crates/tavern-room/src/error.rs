//! Error types for the room layer.

use tavern_persist::PersistError;
use tavern_protocol::{RoomId, UserId};
use tavern_transport::ConnectionId;

/// Errors returned by [`RoomStore`](crate::RoomStore) operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RoomError {
    /// The room is not loaded. Only [`join`](crate::RoomStore::join)
    /// creates rooms.
    #[error("room {0} not found")]
    NotFound(RoomId),

    /// The room has reached its member limit.
    #[error("room {0} is full")]
    RoomFull(RoomId),

    /// The action failed validation. State is unchanged.
    #[error("{0}")]
    InvalidAction(String),

    /// The user is not a member of the room.
    #[error("user {user_id} is not a member of room {room_id}")]
    NotMember { user_id: UserId, room_id: RoomId },

    /// The joining connection was deregistered before the join completed.
    #[error("connection {0} is gone")]
    ConnectionGone(ConnectionId),

    /// The room actor stopped or is being evicted.
    #[error("room {0} is unavailable")]
    Unavailable(RoomId),

    /// The room could not be loaded from storage.
    #[error("room storage failed: {0}")]
    Storage(#[from] PersistError),
}
