//! Accepting side of the transport.
//!
//! [`TransportServer`] builds axum upgrade routes and keeps the registry of
//! live connections. The registry is the only shared structure behind a
//! lock: connections are added when they attach and removed once they are
//! `Closed`, and every fan-out works on a snapshot taken under that lock.

use async_trait::async_trait;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use statecast_protocol::Message;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionConfig, ConnectionMeta};
use crate::metrics;
use crate::traits::{ConnectionHandler, ConnectionId, TransportError};

struct ServerInner {
    registry: Mutex<HashMap<ConnectionId, Connection>>,
    config: ConnectionConfig,
}

/// Registry of live server-side connections.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct TransportServer {
    inner: Arc<ServerInner>,
}

impl TransportServer {
    /// Create a server with the given per-connection settings.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                registry: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Per-connection settings.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Build a router that upgrades requests on `path` and hands every
    /// resulting connection to `handler`.
    ///
    /// Requests that are not WebSocket upgrades are rejected with a 4xx
    /// status.
    pub fn router(&self, path: &str, handler: Arc<dyn ConnectionHandler>) -> Router {
        let state = UpgradeState {
            server: self.clone(),
            handler: Arc::new(Registered {
                server: self.clone(),
                handler,
            }),
        };

        Router::new().route(path, get(upgrade)).with_state(state)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Snapshot of the registered connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.registry.lock().values().cloned().collect()
    }

    /// Look up a registered connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.registry.lock().get(&id).cloned()
    }

    /// Send a message to one connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] if the connection is not
    /// registered, or [`TransportError::ConnectionClosed`] if it is closing.
    pub fn send(&self, id: ConnectionId, message: Message) -> Result<(), TransportError> {
        let connection = self.get(id).ok_or(TransportError::NotConnected)?;
        connection.send(message)
    }

    /// Send a message to every registered connection.
    ///
    /// Returns the number of connections the message was queued for.
    pub fn broadcast(&self, message: Message) -> usize {
        let targets = self.connections();
        fan_out(&targets, &message)
    }

    /// Build a message while the registry is locked, then send it to every
    /// connection registered at that moment.
    ///
    /// A connection attaching concurrently either is in the snapshot or
    /// attaches after the message was built; it never sees both the built
    /// message and an older one from its own attach hook.
    pub fn broadcast_with<F>(&self, build: F) -> usize
    where
        F: FnOnce() -> Option<Message>,
    {
        let (message, targets) = {
            let registry = self.inner.registry.lock();
            let Some(message) = build() else {
                return 0;
            };
            (message, registry.values().cloned().collect::<Vec<_>>())
        };

        fan_out(&targets, &message)
    }

    /// Close every connection and wait until each one is `Closed`.
    pub async fn close_all(&self) {
        let connections = self.connections();
        debug!(count = connections.len(), "Closing all connections");

        for connection in &connections {
            connection.close();
        }
        futures_util::future::join_all(connections.iter().map(Connection::wait_closed)).await;
    }
}

impl Default for TransportServer {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

fn fan_out(targets: &[Connection], message: &Message) -> usize {
    let delivered = targets
        .iter()
        .filter(|connection| connection.send(message.clone()).is_ok())
        .count();

    metrics::record_broadcast(delivered);
    trace!(recipients = delivered, len = message.len(), "Broadcast");
    delivered
}

/// Serve a router, exposing remote addresses to the upgrade handler.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

/// Like [`serve`], stopping the listener once `signal` resolves.
///
/// Upgraded connections are not waited for; use
/// [`TransportServer::close_all`] to close them.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    router: Router,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await
}

#[derive(Clone)]
struct UpgradeState {
    server: TransportServer,
    handler: Arc<dyn ConnectionHandler>,
}

async fn upgrade(
    State(state): State<UpgradeState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(remote = ?remote_addr, reason = %rejection, "Rejected non-upgrade request");
            return rejection.into_response();
        }
    };

    let config = state.server.config().clone();
    let identity = headers
        .get(config.identity_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let meta = ConnectionMeta {
        identity,
        remote_addr,
    };

    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| async move {
            Connection::start(socket, meta, &config, state.handler);
        })
}

/// Wraps a user handler with registry bookkeeping.
struct Registered {
    server: TransportServer,
    handler: Arc<dyn ConnectionHandler>,
}

#[async_trait]
impl ConnectionHandler for Registered {
    fn on_attach(&self, connection: &Connection) {
        let mut registry = self.server.inner.registry.lock();
        registry.insert(connection.id(), connection.clone());
        self.handler.on_attach(connection);
    }

    async fn on_message(&self, connection: &Connection, message: Message) {
        self.handler.on_message(connection, message).await;
    }

    fn on_close(&self, connection: &Connection, initiated_locally: bool) {
        self.server.inner.registry.lock().remove(&connection.id());
        self.handler.on_close(connection, initiated_locally);
    }
}
