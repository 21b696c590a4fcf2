//! Room configuration and lifecycle state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RoomConfig
// ---------------------------------------------------------------------------

/// Settings shared by every room in a [`RoomStore`](crate::RoomStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    /// How long a room with no members stays in memory before it is
    /// flushed and evicted.
    pub idle_timeout: Duration,

    /// Maximum members per room.
    pub max_members: usize,

    /// Capacity of each room's command channel. Callers wait when it is
    /// full, which is the backpressure for a busy room.
    pub command_buffer: usize,

    /// Persist a full snapshot every this many versions, in addition to
    /// the per-action deltas.
    pub snapshot_every: u64,

    /// How many recent actions each room keeps in memory.
    pub log_capacity: usize,

    /// How many chat lines each room keeps for `chatHistory`.
    pub chat_history: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_members: 8,
            command_buffer: 64,
            snapshot_every: 100,
            log_capacity: 256,
            chat_history: 100,
        }
    }
}

impl RoomConfig {
    /// Raises zero-valued limits to 1 so the config is safe to use.
    pub fn validated(mut self) -> Self {
        if self.max_members == 0 {
            tracing::warn!("max_members is 0, using 1");
            self.max_members = 1;
        }
        self.command_buffer = self.command_buffer.max(1);
        self.snapshot_every = self.snapshot_every.max(1);
        self.log_capacity = self.log_capacity.max(1);
        self.chat_history = self.chat_history.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// RoomState
// ---------------------------------------------------------------------------

/// The lifecycle state of a room actor.
///
/// ```text
/// Loading → Active ⇄ Evicting → Closed
///     └──────────────────────────↗
/// ```
///
/// - **Loading**: rehydrating from storage. Commands queue up.
/// - **Active**: serving commands.
/// - **Evicting**: idle timer fired; writing the final snapshot. Goes back
///   to Active if the flush fails or a command arrives meanwhile.
/// - **Closed**: removed from the store. A later access creates a new
///   actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomState {
    Loading,
    Active,
    Evicting,
    Closed,
}

impl RoomState {
    /// Returns `true` if moving to `target` is a legal transition.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Loading, Self::Active)
                | (Self::Loading, Self::Closed)
                | (Self::Active, Self::Evicting)
                | (Self::Active, Self::Closed)
                | (Self::Evicting, Self::Active)
                | (Self::Evicting, Self::Closed)
        )
    }
}

impl std::fmt::Display for RoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loading => write!(f, "Loading"),
            Self::Active => write!(f, "Active"),
            Self::Evicting => write!(f, "Evicting"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_state_transitions() {
        assert!(RoomState::Loading.can_transition_to(RoomState::Active));
        assert!(RoomState::Active.can_transition_to(RoomState::Evicting));
        assert!(RoomState::Evicting.can_transition_to(RoomState::Active));
        assert!(RoomState::Evicting.can_transition_to(RoomState::Closed));
        assert!(!RoomState::Closed.can_transition_to(RoomState::Active));
        assert!(!RoomState::Loading.can_transition_to(RoomState::Evicting));
        assert!(RoomState::Loading.can_transition_to(RoomState::Closed));
        assert!(RoomState::Active.can_transition_to(RoomState::Closed));
        assert!(!RoomState::Active.can_transition_to(RoomState::Active));
        assert!(!RoomState::Closed.can_transition_to(RoomState::Closed));
    }

    #[test]
    fn test_room_state_display() {
        assert_eq!(RoomState::Evicting.to_string(), "Evicting");
    }

    #[test]
    fn test_room_config_default() {
        let config = RoomConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.max_members, 8);
        assert_eq!(config.snapshot_every, 100);
    }

    #[test]
    fn test_room_config_validated_raises_zeroes() {
        let config = RoomConfig {
            max_members: 0,
            command_buffer: 0,
            snapshot_every: 0,
            log_capacity: 0,
            chat_history: 0,
            ..RoomConfig::default()
        }
        .validated();
        assert_eq!(config.max_members, 1);
        assert_eq!(config.command_buffer, 1);
        assert_eq!(config.snapshot_every, 1);
        assert_eq!(config.log_capacity, 1);
        assert_eq!(config.chat_history, 1);
    }
}
