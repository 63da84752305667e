//! JSON encoding and decoding of gateway [`Frame`]s.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::frame::Frame;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A payload was required but the frame carried none.
    #[error("missing payload")]
    MissingPayload,
}

/// Encodes a [`Frame`] as a JSON text message.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`Frame`] from a JSON text message.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not JSON or does not
/// match one of the frame shapes.
pub fn decode(text: &str) -> Result<Frame, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Parses a frame payload into a typed value.
///
/// # Errors
///
/// Returns `CodecError::MissingPayload` when `payload` is `None`, or
/// `CodecError::Serialization` when it does not match `T`.
pub fn decode_payload<T: DeserializeOwned>(payload: Option<&Value>) -> Result<T, CodecError> {
    let value = payload.ok_or(CodecError::MissingPayload)?;
    T::deserialize(value).map_err(|e| CodecError::Serialization(e.to_string()))
}
