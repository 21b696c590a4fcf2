//! Operational alerting hook.

use tavern_protocol::RoomId;

use crate::PersistError;

/// A persistence failure that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub room_id: RoomId,
    pub error: PersistError,
}

/// Receives persistence alerts.
///
/// Implement this to page someone, bump a counter, or post to a chat
/// channel. Called from the writer task, so it must not block for long.
pub trait AlertSink: Send + Sync + 'static {
    fn alert(&self, alert: Alert);
}

/// The default sink: logs at `error` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlert;

impl AlertSink for LogAlert {
    fn alert(&self, alert: Alert) {
        tracing::error!(room_id = %alert.room_id, error = %alert.error, "persistence degraded");
    }
}
