//! Spectator server.
//!
//! Each connection is a user, identified by the identity header sent at
//! connect time (user `0` when it is missing or not a number). The server
//! remembers the state of every user currently in a play session so a user
//! who starts watching late is caught up immediately.

use dashmap::DashMap;
use statecast_core::{CallContext, HandlerError, HubServer, ServerInvoker};
use statecast_transport::TransportServer;
use std::sync::Arc;
use tracing::{debug, info};

use crate::method::Method;
use crate::types::{FrameDataBundle, SpectatorState};
use crate::SpectatorError;

/// User id of a connection without a usable identity.
pub const ANONYMOUS_USER: i32 = 0;

fn user_id(ctx: &CallContext) -> i32 {
    ctx.identity()
        .and_then(|identity| identity.trim().parse().ok())
        .unwrap_or(ANONYMOUS_USER)
}

#[derive(Clone)]
struct Sessions {
    states: Arc<DashMap<i32, SpectatorState>>,
    invoker: ServerInvoker,
}

impl Sessions {
    fn begin_play_session(
        &self,
        ctx: &CallContext,
        state: SpectatorState,
    ) -> Result<(), HandlerError> {
        let user = user_id(ctx);
        self.states.entry(user).or_insert_with(|| state.clone());
        debug!(user, beatmap = ?state.beatmap_id, "Play session began");

        self.invoker
            .invoke(Method::UserBeganPlaying.as_str(), (user, state))?;
        Ok(())
    }

    fn end_play_session(
        &self,
        ctx: &CallContext,
        state: SpectatorState,
    ) -> Result<(), HandlerError> {
        let user = user_id(ctx);
        self.states.remove(&user);
        debug!(user, "Play session ended");

        self.invoker
            .invoke(Method::UserFinishedPlaying.as_str(), (user, state))?;
        Ok(())
    }

    fn send_frame_data(
        &self,
        ctx: &CallContext,
        bundle: FrameDataBundle,
    ) -> Result<(), HandlerError> {
        let user = user_id(ctx);
        self.invoker
            .invoke(Method::UserSentFrames.as_str(), (user, bundle))?;
        Ok(())
    }

    fn start_watching_user(&self, ctx: &CallContext, watched: i32) -> Result<(), HandlerError> {
        let Some(state) = self.states.get(&watched).map(|entry| entry.value().clone()) else {
            return Ok(());
        };

        debug!(watcher = user_id(ctx), watched, "Catching up new watcher");
        self.invoker.invoke_to(
            ctx.connection(),
            Method::UserBeganPlaying.as_str(),
            (watched, state),
        )?;
        Ok(())
    }
}

/// Spectator hub server.
#[derive(Clone)]
pub struct SpectatorServer {
    hub: HubServer,
    states: Arc<DashMap<i32, SpectatorState>>,
}

impl SpectatorServer {
    /// Create the server and register its methods.
    ///
    /// # Errors
    ///
    /// Returns an error if a method cannot be registered.
    pub fn new(server: TransportServer) -> Result<Self, SpectatorError> {
        let hub = HubServer::new(server);
        let states = Arc::new(DashMap::new());
        let sessions = Sessions {
            states: Arc::clone(&states),
            invoker: hub.invoker(),
        };

        let s = sessions.clone();
        hub.on(
            Method::BeginPlaySession.as_str(),
            move |ctx: CallContext, (state,): (SpectatorState,)| {
                let result = s.begin_play_session(&ctx, state);
                async move { result }
            },
        )?;

        let s = sessions.clone();
        hub.on(
            Method::EndPlaySession.as_str(),
            move |ctx: CallContext, (state,): (SpectatorState,)| {
                let result = s.end_play_session(&ctx, state);
                async move { result }
            },
        )?;

        let s = sessions.clone();
        hub.on(
            Method::SendFrameData.as_str(),
            move |ctx: CallContext, (bundle,): (FrameDataBundle,)| {
                let result = s.send_frame_data(&ctx, bundle);
                async move { result }
            },
        )?;

        let s = sessions;
        hub.on(
            Method::StartWatchingUser.as_str(),
            move |ctx: CallContext, (watched,): (i32,)| {
                let result = s.start_watching_user(&ctx, watched);
                async move { result }
            },
        )?;

        hub.on(
            Method::EndWatchingUser.as_str(),
            |_ctx: CallContext, (_watched,): (i32,)| async { Ok::<(), HandlerError>(()) },
        )?;

        info!("Spectator server ready");
        Ok(Self { hub, states })
    }

    /// Build the upgrade route on `path`.
    pub fn router(&self, path: &str) -> axum::Router {
        self.hub.router(path)
    }

    /// Users currently in a play session, in ascending order.
    #[must_use]
    pub fn playing_users(&self) -> Vec<i32> {
        let mut users: Vec<i32> = self.states.iter().map(|entry| *entry.key()).collect();
        users.sort_unstable();
        users
    }

    /// The remembered state of `user`.
    #[must_use]
    pub fn state_of(&self, user: i32) -> Option<SpectatorState> {
        self.states.get(&user).map(|entry| entry.value().clone())
    }

    /// Number of connected users.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.hub.connection_count()
    }

    /// The underlying hub server.
    #[must_use]
    pub fn hub(&self) -> &HubServer {
        &self.hub
    }

    /// Close every connection.
    pub async fn close(&self) {
        self.hub.close().await;
    }
}
