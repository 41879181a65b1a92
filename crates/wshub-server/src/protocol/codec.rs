//! Text frame ⇄ [`Message`] conversion.
//!
//! Decoding happens in two steps so that failures carry a precise diagnostic:
//! the envelope is parsed and its `type` resolved first, then the required
//! fields for that type are checked before the typed deserialization.
//! [`decode_inbound`] additionally refuses kinds only the hub may send, before
//! any field is looked at.

use serde_json::Value;
use thiserror::Error;

use super::message::{Message, MessageKind};

/// Why an inbound frame could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// The frame is JSON but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,
    /// The envelope has no `type` field.
    #[error("missing field `type`")]
    MissingType,
    /// `type` names no known message kind.
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// A field required by the message kind is absent.
    #[error("missing field `{field}` for message type `{kind}`")]
    MissingField {
        /// Kind named by the envelope.
        kind: MessageKind,
        /// Absent field.
        field: &'static str,
    },
    /// A field is present but has the wrong shape.
    #[error("invalid `{kind}` message: {detail}")]
    InvalidField {
        /// Kind named by the envelope.
        kind: MessageKind,
        /// Serde diagnostic.
        detail: String,
    },
}

/// Decode one text frame of any kind.
pub fn decode(raw: &str) -> Result<Message, DecodeError> {
    decode_with(raw, |_| true)
}

/// Decode a frame sent by a client.
///
/// Kinds for which [`MessageKind::is_client_kind`] is false are reported as
/// [`DecodeError::UnknownType`] whatever fields they carry.
pub fn decode_inbound(raw: &str) -> Result<Message, DecodeError> {
    decode_with(raw, MessageKind::is_client_kind)
}

fn decode_with(raw: &str, accept: impl Fn(MessageKind) -> bool) -> Result<Message, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let Value::Object(fields) = &value else {
        return Err(DecodeError::NotAnObject);
    };

    let kind = match fields.get("type") {
        None => return Err(DecodeError::MissingType),
        Some(Value::String(tag)) => MessageKind::from_wire(tag)
            .filter(|kind| accept(*kind))
            .ok_or_else(|| DecodeError::UnknownType(tag.clone()))?,
        // Non-string discriminators can never match a kind
        Some(other) => return Err(DecodeError::UnknownType(other.to_string())),
    };

    if let Some(field) = kind
        .required_fields()
        .iter()
        .copied()
        .find(|field| !fields.contains_key(*field))
    {
        return Err(DecodeError::MissingField { kind, field });
    }

    serde_json::from_value(value).map_err(|e| DecodeError::InvalidField {
        kind,
        detail: e.to_string(),
    })
}

/// Encode a message as a single-line JSON text frame.
pub fn encode(message: &Message) -> serde_json::Result<String> {
    serde_json::to_string(message)
}
