//! Transport-level identifiers, errors and the connection handler seam.

use async_trait::async_trait;
use statecast_protocol::{Message, ProtocolError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::connection::Connection;

/// Process-wide connection id allocator.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Socket lifecycle state.
///
/// States are ordered and a connection only ever moves forward:
/// `Connecting -> Open -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Created, pumps not yet running.
    Connecting,
    /// Pumps running, messages flow both ways.
    Open,
    /// Close handshake in progress.
    Closing,
    /// Pumps joined, socket released, handler notified.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection is closing or closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No connection has been established.
    #[error("Not connected")]
    NotConnected,

    /// Endpoint unreachable or upgrade rejected.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Invalid request header.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives connection lifecycle events.
///
/// Servers and clients hand every connection's events to one handler. All
/// methods have no-op defaults.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once the connection is open, before its pumps start.
    ///
    /// On a server this runs while the connection registry is locked, so it
    /// is ordered with respect to every broadcast. It must not block and
    /// must not call back into the registry.
    fn on_attach(&self, _connection: &Connection) {}

    /// Called for every whole message received.
    ///
    /// Runs inline on the connection's receive pump: a slow handler delays
    /// further messages on this connection only.
    async fn on_message(&self, _connection: &Connection, _message: Message) {}

    /// Called once both pumps have finished and the socket is released,
    /// just before the connection is marked `Closed`.
    fn on_close(&self, _connection: &Connection, _initiated_locally: bool) {}
}

/// A handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let id1 = ConnectionId::next();
        let id2 = ConnectionId::next();
        assert_ne!(id1, id2);
        assert!(id2 > id1);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn test_state_ordering() {
        assert!(ConnectionState::Connecting < ConnectionState::Open);
        assert!(ConnectionState::Open < ConnectionState::Closing);
        assert!(ConnectionState::Closing < ConnectionState::Closed);
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }
}
