//! Serialization and deserialization for the Betterish wire protocol.
//!
//! Every frame is a single postcard-encoded value carried in one WebSocket
//! binary message, so no length-prefix framing is needed.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame exceeds the permitted size.
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual frame size in bytes.
        size: usize,
        /// Permitted maximum in bytes.
        max: usize,
    },
}

/// Encodes a value into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a value from a byte slice using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Like [`decode`], but rejects frames larger than `max` bytes up front.
///
/// # Errors
///
/// Returns `CodecError::TooLarge` for oversized input, otherwise the errors
/// of [`decode`].
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8], max: usize) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max,
        });
    }
    decode(bytes)
}
