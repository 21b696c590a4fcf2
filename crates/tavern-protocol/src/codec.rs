//! Codec trait and the JSON implementation.
//!
//! A codec converts between Rust values and the bytes carried in one
//! transport frame. The gateway is generic over [`Codec`], so the frame
//! format can change without touching session or room code.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes Rust values to frame bytes and decodes them back.
///
/// `Send + Sync + 'static` because a single codec instance is shared by
/// every connection task for the lifetime of the server.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if the value can't be represented
    /// in this format.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if the bytes are malformed,
    /// incomplete, or don't match the expected shape.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// A [`Codec`] that frames every message as one JSON object.
///
/// ```rust
/// use tavern_protocol::{ClientMessage, Codec, JsonCodec, RoomId};
///
/// let codec = JsonCodec;
/// let msg: ClientMessage = codec
///     .decode(br#"{"type":"join","roomId":"table-1"}"#)
///     .unwrap();
/// assert_eq!(
///     msg,
///     ClientMessage::Join { room_id: RoomId::parse("table-1").unwrap() }
/// );
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientMessage, ErrorCode, ServerMessage};

    #[test]
    fn test_decode_rejects_unknown_message_type() {
        let result: Result<ClientMessage, _> = JsonCodec.decode(br#"{"type":"teleport"}"#);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let result: Result<ClientMessage, _> = JsonCodec.decode(br#"{"type":"jo"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_produces_single_json_object() {
        let bytes = JsonCodec
            .encode(&ServerMessage::error(ErrorCode::BadRequest, "nope"))
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.is_object());
    }
}
