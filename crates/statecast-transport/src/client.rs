//! Connecting side of the transport.

use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream};
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, ConnectionMeta};
use crate::traits::{ConnectionHandler, TransportError};

/// Establishes one connection to a WebSocket endpoint.
///
/// ```rust,ignore
/// let connection = TransportClient::new("ws://127.0.0.1:7270/spectator")
///     .identity("1001")
///     .connect(Arc::new(handler))
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct TransportClient {
    url: String,
    headers: Vec<(String, String)>,
    config: ConnectionConfig,
}

impl TransportClient {
    /// Create a client for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            config: ConnectionConfig::default(),
        }
    }

    /// Add a header to the upgrade request.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Send `value` in the configured identity header.
    #[must_use]
    pub fn identity(self, value: impl Into<String>) -> Self {
        let name = self.config.identity_header.clone();
        self.header(name, value)
    }

    /// Replace the connection settings.
    #[must_use]
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// The endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect and start the connection's pumps.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidHeader`] for a header that cannot be
    /// sent, and [`TransportError::Connect`] if the endpoint is unreachable
    /// or rejects the upgrade.
    pub async fn connect(
        &self,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Connection, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        for (name, value) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidHeader(format!("{name}: {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidHeader(format!("{name}: {e}")))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            ..Default::default()
        };

        let (socket, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!(url = %self.url, status = %response.status(), "Connected");

        let remote_addr = match socket.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.peer_addr().ok(),
            _ => None,
        };
        let identity = self
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.config.identity_header))
            .map(|(_, value)| value.clone());

        let meta = ConnectionMeta {
            identity,
            remote_addr,
        };
        Ok(Connection::start(socket, meta, &self.config, handler))
    }
}
