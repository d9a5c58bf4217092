//! State broadcast multiplexer.
//!
//! The multiplexer owns the registry of broadcasters, keyed by stream key,
//! and the transport server their envelopes fan out through. When a
//! connection attaches, every registered broadcaster with a value is replayed
//! to that connection alone, before any later change can reach it.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use statecast_protocol::{codec, BroadcastEnvelope, Encoding, Message, ProtocolError};
use statecast_transport::{Connection, ConnectionHandler, TransportServer};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::broadcaster::Broadcaster;

/// Multiplexer errors.
#[derive(Debug, Error)]
pub enum MultiplexerError {
    /// A broadcaster with this key is already registered.
    #[error("Stream key already registered: {0}")]
    DuplicateKey(String),

    /// No broadcaster is registered under this key.
    #[error("Stream key not registered: {0}")]
    UnknownKey(String),

    /// The payload could not be serialized.
    #[error("Payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The envelope could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

struct MuxInner {
    server: TransportServer,
    broadcasters: DashMap<String, Arc<dyn Broadcaster>>,
    encoding: Encoding,
}

/// Registry of broadcasters over one transport server.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Create a multiplexer that sends JSON envelopes through `server`.
    #[must_use]
    pub fn new(server: TransportServer) -> Self {
        Self::with_encoding(server, Encoding::Json)
    }

    /// Create a multiplexer with an explicit envelope encoding.
    #[must_use]
    pub fn with_encoding(server: TransportServer, encoding: Encoding) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                server,
                broadcasters: DashMap::new(),
                encoding,
            }),
        }
    }

    /// The underlying transport server.
    #[must_use]
    pub fn server(&self) -> &TransportServer {
        &self.inner.server
    }

    /// Register a broadcaster under its stream key.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::DuplicateKey`] if the key is taken. The
    /// existing broadcaster stays registered.
    pub fn register(&self, broadcaster: Arc<dyn Broadcaster>) -> Result<(), MultiplexerError> {
        let key = broadcaster.type_key().to_string();
        match self.inner.broadcasters.entry(key.clone()) {
            Entry::Occupied(_) => {
                warn!(key = %key, "Stream key already registered");
                Err(MultiplexerError::DuplicateKey(key))
            }
            Entry::Vacant(slot) => {
                slot.insert(broadcaster);
                debug!(key = %key, "Broadcaster registered");
                Ok(())
            }
        }
    }

    /// Remove the broadcaster registered under `key`.
    ///
    /// Returns `true` if one was removed.
    pub fn unregister(&self, key: &str) -> bool {
        let removed = self.inner.broadcasters.remove(key).is_some();
        if removed {
            debug!(key = %key, "Broadcaster unregistered");
        }
        removed
    }

    /// Whether a broadcaster is registered under `key`.
    #[must_use]
    pub fn is_registered(&self, key: &str) -> bool {
        self.inner.broadcasters.contains_key(key)
    }

    /// Registered stream keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .broadcasters
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Wrap `data` in an envelope under `key` and send it to every connection.
    ///
    /// Returns the number of connections it was queued for.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be serialized.
    pub fn broadcast<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
    ) -> Result<usize, MultiplexerError> {
        let envelope = BroadcastEnvelope::from_data(key, data)?;
        let message = codec::encode(&envelope, self.inner.encoding)?;
        let recipients = self.inner.server.broadcast(message);
        trace!(key = %key, recipients, "State broadcast");
        Ok(recipients)
    }

    /// Publish a broadcaster's current value to every connection.
    ///
    /// The value is read while the connection registry is locked, so a
    /// connection attaching at the same time receives it exactly once.
    /// Nothing is sent when the broadcaster has no value or is no longer
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded.
    pub fn emit(&self, broadcaster: &dyn Broadcaster) -> Result<usize, MultiplexerError> {
        let key = broadcaster.type_key();
        let mut failure = None;

        let recipients = self.inner.server.broadcast_with(|| {
            if !self.is_registered(key) {
                return None;
            }
            let data = broadcaster.current()?;
            match self.envelope(key, data) {
                Ok(message) => Some(message),
                Err(e) => {
                    failure = Some(e);
                    None
                }
            }
        });

        match failure {
            Some(e) => Err(e),
            None => {
                trace!(key = %key, recipients, "State emitted");
                Ok(recipients)
            }
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.server.connection_count()
    }

    /// Build the upgrade route for observers on `path`.
    pub fn router(&self, path: &str) -> axum::Router {
        self.inner.server.router(
            path,
            Arc::new(ResendOnAttach {
                multiplexer: self.clone(),
            }),
        )
    }

    fn envelope(&self, key: &str, data: Value) -> Result<Message, MultiplexerError> {
        let envelope = BroadcastEnvelope::new(key, data);
        Ok(codec::encode(&envelope, self.inner.encoding)?)
    }

    fn resend(&self, connection: &Connection) {
        let mut sent = 0usize;
        for entry in self.inner.broadcasters.iter() {
            let Some(data) = entry.value().current() else {
                continue;
            };

            match self.envelope(entry.key(), data) {
                Ok(message) => {
                    if connection.send(message).is_ok() {
                        sent += 1;
                    }
                }
                Err(e) => warn!(key = %entry.key(), error = %e, "Resend encoding failed"),
            }
        }
        debug!(connection = %connection.id(), streams = sent, "Replayed current state");
    }
}

struct ResendOnAttach {
    multiplexer: Multiplexer,
}

#[async_trait]
impl ConnectionHandler for ResendOnAttach {
    fn on_attach(&self, connection: &Connection) {
        self.multiplexer.resend(connection);
    }

    async fn on_message(&self, connection: &Connection, message: Message) {
        trace!(connection = %connection.id(), len = message.len(), "Ignoring observer message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::ManualBroadcaster;

    #[test]
    fn test_duplicate_key_keeps_first() {
        let mux = Multiplexer::new(TransportServer::default());
        let _first = ManualBroadcaster::register(&mux, "game.beatmap").unwrap();
        let second = ManualBroadcaster::register(&mux, "game.beatmap");
        assert!(matches!(second, Err(MultiplexerError::DuplicateKey(k)) if k == "game.beatmap"));
        assert!(mux.is_registered("game.beatmap"));
        assert_eq!(mux.keys(), vec!["game.beatmap".to_string()]);
    }

    #[test]
    fn test_unregister() {
        let mux = Multiplexer::new(TransportServer::default());
        let b = ManualBroadcaster::register(&mux, "play.combo").unwrap();
        assert!(mux.unregister("play.combo"));
        assert!(!mux.unregister("play.combo"));
        assert!(!mux.is_registered(b.type_key()));
    }

    #[test]
    fn test_broadcast_without_connections() {
        let mux = Multiplexer::new(TransportServer::default());
        assert_eq!(mux.broadcast("play.score", &1234).unwrap(), 0);
    }
}
