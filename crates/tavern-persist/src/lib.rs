//! Durable storage for Tavern rooms.
//!
//! Live rooms are authoritative in memory. This crate mirrors them to a
//! document store in the background and rebuilds them after a restart.
//!
//! - [`DocumentStore`]: the storage seam. [`MemoryStore`] and
//!   [`JsonFileStore`] are provided; a database driver implements the same
//!   four methods.
//! - [`PersistenceBridge`]: load, background delta writer, and flush, with
//!   retry ([`RetryPolicy`]) and alerting ([`AlertSink`]).
//!
//! Storage never sits on a room's mutation path: deltas are handed to a
//! per-room writer task and the room moves on.

mod alert;
mod bridge;
mod config;
mod error;
mod file;
mod store;

pub use alert::{Alert, AlertSink, LogAlert};
pub use bridge::{DeltaWriter, PersistenceBridge, Rehydrated};
pub use config::{PersistConfig, RetryPolicy};
pub use error::{PersistError, StorageError};
pub use file::JsonFileStore;
pub use store::{DocumentStore, MemoryStore};
