//! Codec for encoding and decoding envelopes.
//!
//! Envelopes travel as JSON in text messages by default. MessagePack in
//! binary messages is available for peers that prefer a compact encoding.
//! Decoding picks the format from the message kind, so a receiver accepts
//! both without negotiation.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::message::{Message, MessageKind};

/// Maximum message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {0} exceeds maximum {MAX_MESSAGE_SIZE}")]
    MessageTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invocation arguments did not serialize to a sequence.
    #[error("Invocation arguments must be a sequence")]
    ArgsNotSequence,

    /// Invocation arguments did not match the handler signature.
    #[error("Argument mismatch: {0}")]
    Arguments(serde_json::Error),
}

/// Payload encoding used for outgoing messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// JSON in a text message.
    #[default]
    Json,
    /// MessagePack in a binary message.
    MessagePack,
}

/// Encode a value into a message.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is too large.
pub fn encode<T: Serialize + ?Sized>(value: &T, encoding: Encoding) -> Result<Message, ProtocolError> {
    let message = match encoding {
        Encoding::Json => Message::text(serde_json::to_string(value)?),
        Encoding::MessagePack => Message::binary(rmp_serde::to_vec_named(value)?),
    };

    if message.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(message.len()));
    }

    Ok(message)
}

/// Decode a value from a message.
///
/// Text messages are parsed as JSON, binary messages as MessagePack.
///
/// # Errors
///
/// Returns an error if the message is too large or malformed.
pub fn decode<T: DeserializeOwned>(message: &Message) -> Result<T, ProtocolError> {
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(message.len()));
    }

    match message.kind() {
        MessageKind::Text => Ok(serde_json::from_slice(message.payload())?),
        MessageKind::Binary => Ok(rmp_serde::from_slice(message.payload())?),
    }
}
