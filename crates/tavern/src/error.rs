//! Unified error type for Tavern, and the mapping from room errors to wire
//! codes.

use tavern_persist::{PersistError, StorageError};
use tavern_protocol::{ErrorCode, ProtocolError};
use tavern_room::RoomError;
use tavern_session::SessionError;
use tavern_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `tavern` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant generates the `From` impls, so `?` converts
/// sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TavernError {
    /// A transport-level error (bind, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, bad room id).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (authentication, expiry, unknown connection).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A room-level error (full, not found, invalid action).
    #[error(transparent)]
    Room(#[from] RoomError),

    /// A storage error that outlived its retries.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// The document store could not be opened.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The peer broke the connection handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer did not answer within the allowed time.
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// The wire code a client sees for a failed room operation.
pub fn error_code(err: &RoomError) -> ErrorCode {
    match err {
        RoomError::InvalidAction(_) => ErrorCode::InvalidAction,
        RoomError::NotFound(_) => ErrorCode::RoomNotFound,
        RoomError::NotMember { .. } => ErrorCode::NotJoined,
        RoomError::RoomFull(_) => ErrorCode::RoomFull,
        RoomError::Storage(_) | RoomError::Unavailable(_) => ErrorCode::StorageUnavailable,
        RoomError::ConnectionGone(_) => ErrorCode::BadRequest,
    }
}
