//! Gateway settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-connection limits enforced by the session gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// How long a new connection has to send its `auth` frame.
    pub auth_timeout: Duration,

    /// Upper bound on one join, including loading the room from storage.
    pub join_timeout: Duration,

    /// A connection that sends nothing for this long is closed.
    pub idle_timeout: Duration,

    /// Capacity of each connection's outbound queue. A peer whose queue
    /// fills up is disconnected.
    pub outbound_buffer: usize,

    /// How long shutdown waits for open connections to finish before the
    /// rooms are flushed.
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            outbound_buffer: 256,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl GatewayConfig {
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = capacity;
        self
    }

    /// Replaces zero durations and capacities with the defaults.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        for (value, fallback, name) in [
            (&mut self.auth_timeout, defaults.auth_timeout, "auth_timeout"),
            (&mut self.join_timeout, defaults.join_timeout, "join_timeout"),
            (&mut self.idle_timeout, defaults.idle_timeout, "idle_timeout"),
        ] {
            if value.is_zero() {
                tracing::warn!(setting = name, "zero timeout, using default");
                *value = fallback;
            }
        }
        if self.outbound_buffer == 0 {
            self.outbound_buffer = defaults.outbound_buffer;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.auth_timeout, Duration::from_secs(5));
        assert_eq!(config.join_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.outbound_buffer, 256);
    }

    #[test]
    fn test_setters_chain() {
        let config = GatewayConfig::default()
            .auth_timeout(Duration::from_millis(100))
            .idle_timeout(Duration::from_secs(1))
            .outbound_buffer(4);
        assert_eq!(config.auth_timeout, Duration::from_millis(100));
        assert_eq!(config.idle_timeout, Duration::from_secs(1));
        assert_eq!(config.outbound_buffer, 4);
    }

    #[test]
    fn test_validated_replaces_zero_values() {
        let config = GatewayConfig::default()
            .join_timeout(Duration::ZERO)
            .outbound_buffer(0)
            .validated();
        assert_eq!(config.join_timeout, Duration::from_secs(30));
        assert_eq!(config.outbound_buffer, 256);
    }
}
