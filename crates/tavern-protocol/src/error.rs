//! Error types for the protocol layer.

/// Errors that can occur while encoding, decoding, or validating wire data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (Rust value → bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (bytes → Rust value): malformed JSON, an
    /// unknown `type` tag, missing fields, or a field of the wrong shape.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// A room identifier is empty, too long, or uses characters outside
    /// `[A-Za-z0-9_-]`.
    #[error("invalid room id {0:?}")]
    InvalidRoomId(String),
}
