//! Wire codec
//!
//! Turns WebSocket frame payloads into typed messages and back. Decoding is
//! two-phase: the payload must be a JSON object with a string `type`, then it
//! is deserialized into the typed enum. Types this build does not know are
//! reported as [`Decoded::Unknown`] rather than as errors.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::messages::{ClientMessage, ServerMessage, WireMessage};
use crate::error::{Error, Result};

/// Maximum accepted frame payload (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Outcome of decoding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<M> {
    /// A recognized message
    Message(M),
    /// Well-formed, but the `type` is not one we handle
    Unknown(String),
}

/// Serialize a message to its wire text
pub fn encode<M: Serialize>(message: &M) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a text frame sent by the coordination endpoint
pub fn decode_server_message(text: &str) -> Result<Decoded<ServerMessage>> {
    decode(text)
}

/// Decode a text frame sent by a client
pub fn decode_client_message(text: &str) -> Result<Decoded<ClientMessage>> {
    decode(text)
}

/// Decode a binary frame holding UTF-8 JSON
pub fn decode_bytes<M>(bytes: &[u8]) -> Result<Decoded<M>>
where
    M: WireMessage + DeserializeOwned,
{
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::malformed(format!("binary frame is not UTF-8: {e}")))?;
    decode(text)
}

/// Decode a text frame into either message direction
pub fn decode<M>(text: &str) -> Result<Decoded<M>>
where
    M: WireMessage + DeserializeOwned,
{
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(Error::malformed(format!(
            "frame of {} bytes exceeds limit of {}",
            text.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::malformed(format!("invalid JSON: {e}")))?;

    let kind = match &value {
        Value::Object(map) => match map.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err(Error::malformed("`type` must be a string")),
            None => return Err(Error::malformed("missing `type` discriminator")),
        },
        _ => return Err(Error::malformed("message is not a JSON object")),
    };

    let message: M = serde_json::from_value(value)
        .map_err(|e| Error::malformed(format!("invalid `{kind}` message: {e}")))?;

    if message.is_unknown() {
        Ok(Decoded::Unknown(kind))
    } else {
        Ok(Decoded::Message(message))
    }
}
