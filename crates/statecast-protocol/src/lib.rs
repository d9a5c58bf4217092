//! # statecast-protocol
//!
//! Wire definitions for the statecast state-distribution layer.
//!
//! This crate defines what travels over a connection: whole logical
//! [`Message`]s and the two envelopes carried inside them.
//!
//! ## Envelopes
//!
//! - `Invocation` - one-way method call, `{"method": .., "args": [..]}`
//! - `BroadcastEnvelope` - named state update, `{"type": .., "data": ..}`
//!
//! ## Example
//!
//! ```rust
//! use statecast_protocol::{codec, BroadcastEnvelope, Encoding};
//!
//! let envelope = BroadcastEnvelope::new("game.beatmap", serde_json::json!({ "id": 7 }));
//!
//! let message = codec::encode(&envelope, Encoding::Json).unwrap();
//! let decoded: BroadcastEnvelope = codec::decode(&message).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod codec;
pub mod envelope;
pub mod message;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use envelope::{decode_args, BroadcastEnvelope, Invocation};
pub use message::{Message, MessageKind};
