//! JSON text framing for [`ServerEvent`] and [`ClientEvent`].
//!
//! Each WebSocket text frame carries exactly one event, so no length
//! prefix is needed.

use crate::event::{ClientEvent, ServerEvent};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Encodes a [`ServerEvent`] into a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_server(event: &ServerEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes a [`ServerEvent`] from JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` for malformed JSON or unknown events.
pub fn decode_server(text: &str) -> Result<ServerEvent, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes a [`ClientEvent`] into a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes a [`ClientEvent`] from JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` for malformed JSON or unknown events.
pub fn decode_client(text: &str) -> Result<ClientEvent, CodecError> {
    Ok(serde_json::from_str(text)?)
}
