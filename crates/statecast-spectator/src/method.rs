//! Method vocabulary.

use std::fmt;

/// Spectator hub methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Client to server: a play session started. Args: `(SpectatorState,)`.
    BeginPlaySession,
    /// Client to server: a play session ended. Args: `(SpectatorState,)`.
    EndPlaySession,
    /// Client to server: start watching a user. Args: `(user_id,)`.
    StartWatchingUser,
    /// Client to server: stop watching a user. Args: `(user_id,)`.
    EndWatchingUser,
    /// Client to server: a batch of frames. Args: `(FrameDataBundle,)`.
    SendFrameData,
    /// Server to client. Args: `(user_id, SpectatorState)`.
    UserBeganPlaying,
    /// Server to client. Args: `(user_id, SpectatorState)`.
    UserFinishedPlaying,
    /// Server to client. Args: `(user_id, FrameDataBundle)`.
    UserSentFrames,
}

impl Method {
    /// Methods handled by the server.
    pub const SERVER: [Method; 5] = [
        Method::BeginPlaySession,
        Method::EndPlaySession,
        Method::StartWatchingUser,
        Method::EndWatchingUser,
        Method::SendFrameData,
    ];

    /// Methods handled by clients.
    pub const CLIENT: [Method; 3] = [
        Method::UserBeganPlaying,
        Method::UserFinishedPlaying,
        Method::UserSentFrames,
    ];

    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::BeginPlaySession => "BeginPlaySession",
            Method::EndPlaySession => "EndPlaySession",
            Method::StartWatchingUser => "StartWatchingUser",
            Method::EndWatchingUser => "EndWatchingUser",
            Method::SendFrameData => "SendFrameData",
            Method::UserBeganPlaying => "UserBeganPlaying",
            Method::UserFinishedPlaying => "UserFinishedPlaying",
            Method::UserSentFrames => "UserSentFrames",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
