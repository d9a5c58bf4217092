//! Hub endpoints: a [`HubServer`] accepting many callers and a
//! [`HubClient`] holding one connection.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use statecast_protocol::{Encoding, Message};
use statecast_transport::{
    Connection, ConnectionConfig, ConnectionHandler, TransportClient, TransportError,
    TransportServer,
};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::hub::{encode_invocation, CallContext, HandlerError, Hub, HubError};

/// Feeds every message of a connection to a hub.
struct HubDispatch {
    hub: Arc<Hub>,
}

#[async_trait]
impl ConnectionHandler for HubDispatch {
    async fn on_message(&self, connection: &Connection, message: Message) {
        self.hub
            .dispatch(CallContext::new(connection.clone()), &message)
            .await;
    }
}

/// Outgoing half of a [`HubServer`].
///
/// Handlers capture this instead of the server so they do not keep the hub
/// alive through its own handler table.
#[derive(Clone)]
pub struct ServerInvoker {
    server: TransportServer,
    encoding: Encoding,
}

impl ServerInvoker {
    /// Call `method` on every connected client.
    ///
    /// Returns the number of connections the call was queued for.
    ///
    /// # Errors
    ///
    /// Returns an error if `args` cannot be encoded.
    pub fn invoke<A: Serialize>(&self, method: &str, args: A) -> Result<usize, HubError> {
        let message = encode_invocation(method, args, self.encoding)?;
        Ok(self.server.broadcast(message))
    }

    /// Call `method` on one connection.
    ///
    /// # Errors
    ///
    /// Returns an error if `args` cannot be encoded or the connection is
    /// closing.
    pub fn invoke_to<A: Serialize>(
        &self,
        connection: &Connection,
        method: &str,
        args: A,
    ) -> Result<(), HubError> {
        let message = encode_invocation(method, args, self.encoding)?;
        connection.send(message)?;
        Ok(())
    }
}

/// Hub served over a [`TransportServer`].
#[derive(Clone)]
pub struct HubServer {
    hub: Arc<Hub>,
    invoker: ServerInvoker,
}

impl HubServer {
    /// Create a hub server that encodes calls as JSON.
    #[must_use]
    pub fn new(server: TransportServer) -> Self {
        Self::with_encoding(server, Encoding::Json)
    }

    /// Create a hub server with an explicit outgoing encoding.
    #[must_use]
    pub fn with_encoding(server: TransportServer, encoding: Encoding) -> Self {
        Self {
            hub: Arc::new(Hub::with_encoding(encoding)),
            invoker: ServerInvoker { server, encoding },
        }
    }

    /// The method registry.
    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// The underlying transport server.
    #[must_use]
    pub fn server(&self) -> &TransportServer {
        &self.invoker.server
    }

    /// Register a handler. See [`Hub::on`].
    ///
    /// # Errors
    ///
    /// Returns [`HubError::DuplicateHandler`] if `method` is taken.
    pub fn on<A, F, Fut>(&self, method: impl Into<String>, handler: F) -> Result<(), HubError>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.hub.on(method, handler)
    }

    /// A cheap handle for outgoing calls.
    #[must_use]
    pub fn invoker(&self) -> ServerInvoker {
        self.invoker.clone()
    }

    /// Call `method` on every connected client. See [`ServerInvoker::invoke`].
    ///
    /// # Errors
    ///
    /// Returns an error if `args` cannot be encoded.
    pub fn invoke<A: Serialize>(&self, method: &str, args: A) -> Result<usize, HubError> {
        self.invoker.invoke(method, args)
    }

    /// Call `method` on one connection. See [`ServerInvoker::invoke_to`].
    ///
    /// # Errors
    ///
    /// Returns an error if `args` cannot be encoded or the connection is
    /// closing.
    pub fn invoke_to<A: Serialize>(
        &self,
        connection: &Connection,
        method: &str,
        args: A,
    ) -> Result<(), HubError> {
        self.invoker.invoke_to(connection, method, args)
    }

    /// Build the upgrade route for callers on `path`.
    pub fn router(&self, path: &str) -> axum::Router {
        self.invoker.server.router(
            path,
            Arc::new(HubDispatch {
                hub: Arc::clone(&self.hub),
            }),
        )
    }

    /// Number of connected callers.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.invoker.server.connection_count()
    }

    /// Close every connection and wait for them to finish.
    pub async fn close(&self) {
        self.invoker.server.close_all().await;
    }
}

/// Hub over one outgoing connection.
///
/// [`start`](Self::start) and [`stop`](Self::stop) are serialized, so at
/// most one connection is ever live.
pub struct HubClient {
    hub: Arc<Hub>,
    config: ConnectionConfig,
    lifecycle: tokio::sync::Mutex<()>,
    connection: Mutex<Option<Connection>>,
}

impl HubClient {
    /// Create a client that encodes calls as JSON.
    #[must_use]
    pub fn new() -> Self {
        Self::with_encoding(Encoding::Json)
    }

    /// Create a client with an explicit outgoing encoding.
    #[must_use]
    pub fn with_encoding(encoding: Encoding) -> Self {
        Self {
            hub: Arc::new(Hub::with_encoding(encoding)),
            config: ConnectionConfig::default(),
            lifecycle: tokio::sync::Mutex::new(()),
            connection: Mutex::new(None),
        }
    }

    /// Replace the connection settings used by later [`start`](Self::start) calls.
    #[must_use]
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// The method registry.
    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Register a handler. See [`Hub::on`].
    ///
    /// # Errors
    ///
    /// Returns [`HubError::DuplicateHandler`] if `method` is taken.
    pub fn on<A, F, Fut>(&self, method: impl Into<String>, handler: F) -> Result<(), HubError>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.hub.on(method, handler)
    }

    /// Connect to `url`, sending `headers` with the upgrade request.
    ///
    /// A previous connection is closed first. Concurrent calls run one
    /// after the other and the last one to finish wins.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Transport`] if the connection cannot be made.
    pub async fn start<I, K, V>(&self, url: &str, headers: I) -> Result<(), HubError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let _lifecycle = self.lifecycle.lock().await;
        self.close_current().await;

        let client = headers
            .into_iter()
            .fold(TransportClient::new(url).config(self.config.clone()), |client, (k, v)| {
                client.header(k, v)
            });
        let connection = client
            .connect(Arc::new(HubDispatch {
                hub: Arc::clone(&self.hub),
            }))
            .await?;

        info!(url = %url, connection = %connection.id(), "Hub client connected");
        *self.connection.lock() = Some(connection);
        Ok(())
    }

    /// Close the connection, if any, and wait for it to finish.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.close_current().await;
    }

    async fn close_current(&self) {
        let previous = self.connection.lock().take();
        if let Some(connection) = previous {
            debug!(connection = %connection.id(), "Hub client stopping");
            connection.shutdown().await;
        }
    }

    /// Call `method` on the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] before [`start`](Self::start),
    /// and [`TransportError::ConnectionClosed`] once the connection closed.
    pub fn invoke<A: Serialize>(&self, method: &str, args: A) -> Result<(), HubError> {
        let message = self.hub.encode(method, args)?;
        let connection = self
            .connection
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        connection.send(message)?;
        Ok(())
    }

    /// Whether a connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(Connection::is_open)
    }

    /// The current connection, if any.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.connection.lock().clone()
    }
}

impl Default for HubClient {
    fn default() -> Self {
        Self::new()
    }
}
