//! Binary frame codec
//!
//! Every relay message is one kind byte followed by an opaque payload:
//! `0` carries a document delta, `1` a presence delta. The payload encoding
//! belongs to the document/presence layer, not to the codec.

use thiserror::Error;

/// Kind byte for document deltas.
pub const KIND_DOC: u8 = 0;
/// Kind byte for presence deltas.
pub const KIND_PRESENCE: u8 = 1;

/// A decoded relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Document delta (opaque update bytes).
    Doc(Vec<u8>),
    /// Presence delta (opaque presence bytes).
    Presence(Vec<u8>),
}

/// Frame decode failures. All of them are per-message: the connection
/// that produced a bad frame stays open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
}

impl Frame {
    /// Decode a frame from raw message bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        match bytes.split_first() {
            None => Err(FrameError::Empty),
            Some((&KIND_DOC, payload)) => Ok(Frame::Doc(payload.to_vec())),
            Some((&KIND_PRESENCE, payload)) => Ok(Frame::Presence(payload.to_vec())),
            Some((&kind, _)) => Err(FrameError::UnknownKind(kind)),
        }
    }

    /// Encode the frame as kind byte + payload.
    pub fn encode(&self) -> Vec<u8> {
        let (kind, payload) = match self {
            Frame::Doc(payload) => (KIND_DOC, payload),
            Frame::Presence(payload) => (KIND_PRESENCE, payload),
        };
        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(kind);
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Payload bytes, whatever the kind.
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Doc(payload) | Frame::Presence(payload) => payload,
        }
    }
}
