//! Per-connection types: the gateway state machine and registry snapshots.

use std::fmt;
use std::time::Instant;

use tavern_protocol::{RoomId, UserId};
use tavern_transport::ConnectionId;

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Where a connection is in its lifecycle.
///
/// ```text
///   Unauthenticated ──(auth ok)──→ Authenticated ──(join)──→ Joined(room)
///          │                            │    ↑                  │    │
///          │                            │    └──────(leave)─────┘    │
///          │                            │                 (join other room)
///          └────────────────────────────┴───────────→ Closed ←───────┘
/// ```
///
/// `Closed` is terminal. Only `Joined` connections may submit actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the `auth` frame.
    Unauthenticated,
    /// Identity verified, not in a room.
    Authenticated,
    /// Member of exactly one room.
    Joined(RoomId),
    /// Torn down. No further transitions.
    Closed,
}

impl ConnectionState {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Unauthenticated, Authenticated)
                | (Authenticated, Joined(_))
                | (Joined(_), Joined(_))
                | (Joined(_), Authenticated)
                | (Unauthenticated | Authenticated | Joined(_), Closed)
        )
    }

    /// The room this connection is joined to, if any.
    pub fn room(&self) -> Option<&RoomId> {
        match self {
            ConnectionState::Joined(room) => Some(room),
            _ => None,
        }
    }

    /// Returns `true` in the terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unauthenticated => write!(f, "Unauthenticated"),
            ConnectionState::Authenticated => write!(f, "Authenticated"),
            ConnectionState::Joined(room) => write!(f, "Joined({room})"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry views
// ---------------------------------------------------------------------------

/// A point-in-time copy of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub user_id: UserId,
    /// The room the connection is attached to, if any.
    pub room: Option<RoomId>,
    /// When the connection last sent a frame.
    pub last_seen: Instant,
}

/// What was removed when a connection left the registry.
///
/// Returned by deregistration and by a same-user replacement so the caller
/// can run the room-level `leave` for the departed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    /// The room the connection was attached to when it was removed.
    pub room: Option<RoomId>,
}
