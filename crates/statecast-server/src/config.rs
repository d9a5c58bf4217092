//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`statecast.toml`, `/etc/statecast/statecast.toml` or
//!   `~/.config/statecast/statecast.toml`, first match wins)
//! - Environment variables (`STATECAST_HOST`, `STATECAST_PORT`) for fields
//!   the file leaves out

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use statecast_protocol::codec::MAX_MESSAGE_SIZE;
use statecast_transport::connection::{DEFAULT_CLOSE_TIMEOUT, DEFAULT_IDENTITY_HEADER};
use statecast_transport::ConnectionConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upgrade paths.
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    /// Per-connection settings.
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Paths the endpoints are served on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Path of the state multiplexer.
    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Path of the spectator hub.
    #[serde(default = "default_spectator_path")]
    pub spectator_path: String,
}

/// Settings applied to every accepted connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Maximum size of one message in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Close handshake timeout in milliseconds.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Header carrying the caller's identity.
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    std::env::var("STATECAST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("STATECAST_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7270)
}

fn default_true() -> bool {
    true
}

fn default_state_path() -> String {
    "/state".to_string()
}

fn default_spectator_path() -> String {
    "/spectator".to_string()
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_close_timeout() -> u64 {
    DEFAULT_CLOSE_TIMEOUT.as_millis() as u64
}

fn default_identity_header() -> String {
    DEFAULT_IDENTITY_HEADER.to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            endpoints: EndpointsConfig::default(),
            connection: ConnectionSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            spectator_path: default_spectator_path(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            close_timeout_ms: default_close_timeout(),
            identity_header: default_identity_header(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl ConnectionSettings {
    /// Transport settings for the servers.
    #[must_use]
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_message_size: self.max_message_size,
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            identity_header: self.identity_header.to_ascii_lowercase(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "statecast.toml",
            "/etc/statecast/statecast.toml",
            "~/.config/statecast/statecast.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// The socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
