//! # Tavern
//!
//! Real-time multiplayer session engine for tabletop games.
//!
//! Clients connect over WebSocket, authenticate, join a room, and submit
//! actions. Each room validates actions one at a time, advances its version
//! by exactly one per accepted action, fans the resulting delta out to every
//! member, and writes it to durable storage in the background. Idle rooms
//! are flushed and evicted; the next join rehydrates them.
//!
//! ```text
//! Gateway → Room Store → Synchronizer → Connection Registry (fan-out)
//!                                     ↘ Persistence Bridge (storage)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tavern::prelude::*;
//!
//! # async fn run(auth: impl Authenticator) -> Result<(), TavernError> {
//! let server = TavernServer::builder()
//!     .bind("0.0.0.0:8080")
//!     .build(auth, Arc::new(MemoryStore::new()))
//!     .await?;
//! server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```

mod config;
mod error;
mod handler;
pub mod logging;
mod server;

pub use config::GatewayConfig;
pub use error::{TavernError, error_code};
pub use server::{TavernServer, TavernServerBuilder};

pub use tavern_persist as persist;
pub use tavern_protocol as protocol;
pub use tavern_room as room;
pub use tavern_session as session;
pub use tavern_transport as transport;

/// The types most servers need.
pub mod prelude {
    pub use crate::{GatewayConfig, TavernError, TavernServer, TavernServerBuilder};
    pub use tavern_persist::{
        Alert, AlertSink, DocumentStore, JsonFileStore, LogAlert, MemoryStore, PersistConfig,
        RetryPolicy,
    };
    pub use tavern_protocol::{ErrorCode, RoomId, Snapshot, UserId};
    pub use tavern_room::RoomConfig;
    pub use tavern_session::{Authenticator, SessionError, VerifiedIdentity};
}
