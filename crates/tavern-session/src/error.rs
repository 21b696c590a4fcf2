//! Error types for the session layer.

use tavern_transport::ConnectionId;

/// Errors from authentication and the connection registry.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The token was rejected by the [`Authenticator`](crate::Authenticator).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The token was valid once but has expired.
    #[error("identity expired")]
    Expired,

    /// No live connection is registered under this id. It was never
    /// registered, or it has already been deregistered.
    #[error("connection {0} is not registered")]
    NotFound(ConnectionId),
}
