//! Connection identity and the live connection registry for Tavern.
//!
//! This crate covers the connection-level half of a session:
//!
//! 1. **Authentication**: turning a client token into a verified user
//!    ([`Authenticator`], [`VerifiedIdentity`])
//! 2. **Lifecycle**: the per-connection state machine ([`ConnectionState`])
//! 3. **Registry**: who is connected, which room they're in, and how to
//!    reach them ([`ConnectionRegistry`])
//!
//! It has no game semantics. Rooms, actions, and state live in
//! `tavern-room`.
//!
//! ```text
//! Room Layer (above)          ← broadcasts deltas through the registry
//!     ↕
//! Session Layer (this crate)  ← identity, membership index, fan-out
//!     ↕
//! Protocol / Transport        ← UserId, ServerMessage, ConnectionId
//! ```

mod auth;
mod error;
mod registry;
mod session;

pub use auth::{Authenticator, VerifiedIdentity};
pub use error::SessionError;
pub use registry::{ConnectionRegistry, Outbound, Registration};
pub use session::{ConnectionInfo, ConnectionState, Departure};
