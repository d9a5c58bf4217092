//! # statecast-spectator
//!
//! A spectator protocol on the statecast hub: players announce play
//! sessions and stream input frames, watchers receive them, and late
//! watchers are caught up with the current session state.
//!
//! ```rust,ignore
//! let spectator = SpectatorServer::new(TransportServer::default())?;
//! let app = spectator.router("/spectator");
//! ```

pub mod client;
pub mod method;
pub mod server;
pub mod types;

use statecast_core::HubError;
use thiserror::Error;

pub use client::{SpectatorClient, SpectatorEvents};
pub use method::Method;
pub use server::{SpectatorServer, ANONYMOUS_USER};
pub use types::{
    ApiMod, FrameDataBundle, FrameHeader, ReplayFrame, SpectatedUserState, SpectatorState,
};

/// Spectator errors.
#[derive(Debug, Error)]
pub enum SpectatorError {
    /// Hub registration, encoding or connection failure.
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),
}
