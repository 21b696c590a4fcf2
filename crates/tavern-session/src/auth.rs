//! Authentication hook for verifying a connection's identity.
//!
//! Tavern doesn't verify tokens itself. That belongs to your identity
//! provider (a JWT library, an OAuth2 introspection endpoint, ...). The
//! gateway hands the client's token to an [`Authenticator`] during the
//! handshake and trusts the [`VerifiedIdentity`] that comes back.
//!
//! The identity carries an expiry. The gateway rejects identities that are
//! already expired and closes the connection when a live one runs out.

use std::time::{Duration, SystemTime};

use tavern_protocol::UserId;

use crate::SessionError;

/// The result of a successful token verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Who the token belongs to.
    pub user_id: UserId,
    /// When the token stops being valid (a JWT's `exp`).
    pub expires_at: SystemTime,
}

impl VerifiedIdentity {
    /// Builds an identity that is valid for `ttl` from now.
    pub fn valid_for(user_id: UserId, ttl: Duration) -> Self {
        Self {
            user_id,
            expires_at: SystemTime::now() + ttl,
        }
    }

    /// Time left before expiry, or `None` if the identity has expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .duration_since(SystemTime::now())
            .ok()
            .filter(|d| !d.is_zero())
    }

    /// Returns `true` once `expires_at` is in the past.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }
}

/// Validates a client's token and returns their identity.
///
/// `Send + Sync + 'static` because one authenticator is shared by every
/// connection task for the life of the server.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tavern_protocol::UserId;
/// use tavern_session::{Authenticator, SessionError, VerifiedIdentity};
///
/// /// Accepts `user:<name>` tokens. Development only.
/// struct PrefixAuthenticator;
///
/// impl Authenticator for PrefixAuthenticator {
///     async fn authenticate(&self, token: &str) -> Result<VerifiedIdentity, SessionError> {
///         let name = token
///             .strip_prefix("user:")
///             .filter(|n| !n.is_empty())
///             .ok_or_else(|| SessionError::AuthFailed("expected user:<name>".into()))?;
///         Ok(VerifiedIdentity::valid_for(UserId::new(name), Duration::from_secs(3600)))
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Verifies `token`.
    ///
    /// # Errors
    /// [`SessionError::AuthFailed`] for a rejected token,
    /// [`SessionError::Expired`] for one that was valid but no longer is.
    fn authenticate(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<VerifiedIdentity, SessionError>> + Send;
}
