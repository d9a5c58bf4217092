//! # statecast
//!
//! Serves the state multiplexer and the spectator hub.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! statecast
//!
//! # Run with environment overrides
//! STATECAST_PORT=7270 STATECAST_HOST=0.0.0.0 statecast
//! ```
//!
//! Settings are read from `statecast.toml` in the working directory,
//! `/etc/statecast/statecast.toml` or `~/.config/statecast/statecast.toml`.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "statecast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        "Starting statecast server on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await
}
