//! The closed set of messages exchanged with clients.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wshub_core::ConnectionId;

/// Confirmation text sent in every `registered` reply.
pub const REGISTERED_RESPONSE: &str = "you are cool";

/// A decoded envelope.
///
/// Field names match the wire format exactly; `type` is the serde tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Client asks to join the broadcast set.
    Register {
        /// Static token checked against the configured set.
        auth_token: String,
    },
    /// Successful registration, sent to the registering client only.
    Registered {
        /// Fixed confirmation text.
        response: String,
    },
    /// Application-level liveness probe carrying an arbitrary payload.
    Ping {
        /// Echoed back unchanged.
        message: Value,
    },
    /// Reply to [`Message::Ping`].
    Pong {
        /// The payload of the originating ping.
        message: Value,
    },
    /// Client payload. Inbound it carries raw text; the self-echo carries it
    /// base64 encoded.
    Data {
        /// Client-chosen correlation id.
        id: String,
        /// Payload.
        message: String,
    },
    /// Payload relayed to every other registered client.
    Chat {
        /// Identity of the sending connection.
        from: String,
        /// The original, unencoded payload.
        message: String,
    },
    /// Diagnostic sent to the offending client only.
    Error {
        /// Human-readable description.
        response: String,
    },
}

impl Message {
    /// The `registered` confirmation.
    pub fn registered() -> Self {
        Self::Registered {
            response: REGISTERED_RESPONSE.to_string(),
        }
    }

    /// An `error` reply with the given diagnostic.
    pub fn error(response: impl Into<String>) -> Self {
        Self::Error {
            response: response.into(),
        }
    }

    /// Self-echo of a `data` message: same id, payload base64 encoded.
    pub fn data_echo(id: impl Into<String>, payload: &str) -> Self {
        Self::Data {
            id: id.into(),
            message: STANDARD.encode(payload.as_bytes()),
        }
    }

    /// Broadcast copy of a `data` payload.
    pub fn chat(from: ConnectionId, payload: impl Into<String>) -> Self {
        Self::Chat {
            from: from.to_string(),
            message: payload.into(),
        }
    }

    /// The discriminator of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Register { .. } => MessageKind::Register,
            Self::Registered { .. } => MessageKind::Registered,
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
            Self::Data { .. } => MessageKind::Data,
            Self::Chat { .. } => MessageKind::Chat,
            Self::Error { .. } => MessageKind::Error,
        }
    }
}

/// Value of the `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `register`
    Register,
    /// `registered`
    Registered,
    /// `ping`
    Ping,
    /// `pong`
    Pong,
    /// `data`
    Data,
    /// `chat`
    Chat,
    /// `error`
    Error,
}

impl MessageKind {
    /// Every kind, in wire-table order.
    pub const ALL: [Self; 7] = [
        Self::Register,
        Self::Registered,
        Self::Ping,
        Self::Pong,
        Self::Data,
        Self::Chat,
        Self::Error,
    ];

    /// Parse a wire discriminator.
    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    /// The wire discriminator.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Registered => "registered",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Data => "data",
            Self::Chat => "chat",
            Self::Error => "error",
        }
    }

    /// Fields that must be present besides `type`.
    pub const fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Register => &["auth_token"],
            Self::Ping | Self::Pong => &["message"],
            Self::Data => &["id", "message"],
            Self::Chat => &["from", "message"],
            Self::Registered | Self::Error => &["response"],
        }
    }

    /// Whether clients may send this kind.
    pub const fn is_client_kind(self) -> bool {
        matches!(self, Self::Register | Self::Ping | Self::Data)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
