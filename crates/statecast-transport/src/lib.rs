//! # statecast-transport
//!
//! WebSocket transport for statecast.
//!
//! - **Connection** - one socket driven by a send pump and a receive pump,
//!   with a bounded close handshake
//! - **TransportServer** - axum upgrade routes plus the registry of live
//!   connections, with broadcast and unicast
//! - **TransportClient** - a single outgoing connection with connect-time
//!   headers
//!
//! Everything above this layer plugs in through [`ConnectionHandler`].
//!
//! ```rust,ignore
//! use statecast_transport::{serve, TransportServer};
//!
//! let server = TransportServer::default();
//! let app = server.router("/state", Arc::new(MyHandler));
//! serve(listener, app).await?;
//! ```

pub mod client;
pub mod connection;
pub mod metrics;
pub mod server;
pub mod traits;
pub mod wire;

pub use client::TransportClient;
pub use connection::{Connection, ConnectionConfig, ConnectionMeta};
pub use server::{serve, serve_with_shutdown, TransportServer};
pub use traits::{ConnectionHandler, ConnectionId, ConnectionState, NoopHandler, TransportError};
