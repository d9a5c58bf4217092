//! Route wiring and the server lifecycle.

use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{response::IntoResponse, routing::get, Router};
use statecast_core::Multiplexer;
use statecast_spectator::SpectatorServer;
use statecast_transport::{serve_with_shutdown, TransportServer};
use std::future::Future;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// The endpoints served by one process.
pub struct App {
    /// Keyed state streams.
    pub multiplexer: Multiplexer,
    /// Spectator sessions.
    pub spectator: SpectatorServer,
    router: Router,
}

impl App {
    /// Build both endpoints and their routes.
    ///
    /// Each endpoint gets its own connection registry, so a spectator call
    /// never reaches a state subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the spectator methods cannot be registered.
    pub fn new(config: &Config) -> Result<Self> {
        let connection = config.connection.to_connection_config();

        let multiplexer = Multiplexer::new(TransportServer::new(connection.clone()));
        let spectator = SpectatorServer::new(TransportServer::new(connection))
            .context("Failed to set up spectator hub")?;

        let router = Router::new()
            .route("/health", get(health_handler))
            .merge(multiplexer.router(&config.endpoints.state_path))
            .merge(spectator.router(&config.endpoints.spectator_path));

        Ok(Self {
            multiplexer,
            spectator,
            router,
        })
    }

    /// The merged router.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Close every connection on both endpoints.
    pub async fn close(&self) {
        tokio::join!(self.multiplexer.server().close_all(), self.spectator.close());
    }

    /// Serve on `listener` until `signal` resolves, then close every
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting connections fails.
    pub async fn serve<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        serve_with_shutdown(listener, self.router(), signal).await?;

        info!(
            state = self.multiplexer.connection_count(),
            spectator = self.spectator.connection_count(),
            "Closing connections"
        );
        self.close().await;
        Ok(())
    }
}

/// Run the server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = App::new(&config)?;

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Statecast server listening on {}", addr);
    info!("State endpoint: ws://{}{}", addr, config.endpoints.state_path);
    info!(
        "Spectator endpoint: ws://{}{}",
        addr, config.endpoints.spectator_path
    );

    app.serve(listener, shutdown_signal()).await?;

    info!("Statecast server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
