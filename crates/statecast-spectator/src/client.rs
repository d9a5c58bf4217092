//! Spectator client.

use statecast_core::{CallContext, HandlerError, HubClient};
use statecast_transport::ConnectionConfig;
use std::sync::Arc;

use crate::method::Method;
use crate::types::{FrameDataBundle, SpectatorState};
use crate::SpectatorError;

/// Receives server-to-client spectator calls. All methods default to no-ops.
pub trait SpectatorEvents: Send + Sync + 'static {
    fn user_began_playing(&self, _user_id: i32, _state: SpectatorState) {}

    fn user_finished_playing(&self, _user_id: i32, _state: SpectatorState) {}

    fn user_sent_frames(&self, _user_id: i32, _bundle: FrameDataBundle) {}
}

/// Spectator hub client for one user.
pub struct SpectatorClient {
    hub: HubClient,
    identity_header: String,
}

impl SpectatorClient {
    /// Create a client that forwards incoming calls to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if a method cannot be registered.
    pub fn new(events: Arc<dyn SpectatorEvents>) -> Result<Self, SpectatorError> {
        Self::with_config(events, ConnectionConfig::default())
    }

    /// Like [`new`](Self::new), with explicit connection settings. The user
    /// id is sent in `config.identity_header`, which must match the
    /// server's.
    ///
    /// # Errors
    ///
    /// Returns an error if a method cannot be registered.
    pub fn with_config(
        events: Arc<dyn SpectatorEvents>,
        config: ConnectionConfig,
    ) -> Result<Self, SpectatorError> {
        let identity_header = config.identity_header.clone();
        let hub = HubClient::new().with_config(config);

        let e = Arc::clone(&events);
        hub.on(
            Method::UserBeganPlaying.as_str(),
            move |_ctx: CallContext, (user, state): (i32, SpectatorState)| {
                e.user_began_playing(user, state);
                async { Ok::<(), HandlerError>(()) }
            },
        )?;

        let e = Arc::clone(&events);
        hub.on(
            Method::UserFinishedPlaying.as_str(),
            move |_ctx: CallContext, (user, state): (i32, SpectatorState)| {
                e.user_finished_playing(user, state);
                async { Ok::<(), HandlerError>(()) }
            },
        )?;

        let e = events;
        hub.on(
            Method::UserSentFrames.as_str(),
            move |_ctx: CallContext, (user, bundle): (i32, FrameDataBundle)| {
                e.user_sent_frames(user, bundle);
                async { Ok::<(), HandlerError>(()) }
            },
        )?;

        Ok(Self {
            hub,
            identity_header,
        })
    }

    /// Connect to `url` as `user_id`, replacing any previous connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be made.
    pub async fn connect(&self, url: &str, user_id: i32) -> Result<(), SpectatorError> {
        self.hub
            .start(url, [(self.identity_header.as_str(), user_id.to_string())])
            .await?;
        Ok(())
    }

    /// Close the connection.
    pub async fn disconnect(&self) {
        self.hub.stop().await;
    }

    /// Whether the client is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.hub.is_connected()
    }

    /// Announce the start of a play session.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected.
    pub fn begin_playing(&self, state: &SpectatorState) -> Result<(), SpectatorError> {
        self.call(Method::BeginPlaySession, (state,))
    }

    /// Announce the end of a play session.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected.
    pub fn end_playing(&self, state: &SpectatorState) -> Result<(), SpectatorError> {
        self.call(Method::EndPlaySession, (state,))
    }

    /// Send a batch of frames.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected.
    pub fn send_frames(&self, bundle: &FrameDataBundle) -> Result<(), SpectatorError> {
        self.call(Method::SendFrameData, (bundle,))
    }

    /// Start watching `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected.
    pub fn watch_user(&self, user_id: i32) -> Result<(), SpectatorError> {
        self.call(Method::StartWatchingUser, (user_id,))
    }

    /// Stop watching `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected.
    pub fn stop_watching_user(&self, user_id: i32) -> Result<(), SpectatorError> {
        self.call(Method::EndWatchingUser, (user_id,))
    }

    fn call<A: serde::Serialize>(&self, method: Method, args: A) -> Result<(), SpectatorError> {
        self.hub.invoke(method.as_str(), args)?;
        Ok(())
    }
}
