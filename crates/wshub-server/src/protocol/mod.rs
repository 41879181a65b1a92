//! Wire envelope: one JSON object per text frame, discriminated by `type`.

pub mod codec;
pub mod message;

pub use codec::{DecodeError, decode, decode_inbound, encode};
pub use message::{Message, MessageKind};
