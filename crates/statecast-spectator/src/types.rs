//! Spectator payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Where a user is in a play session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectatedUserState {
    #[default]
    Idle,
    Playing,
    Paused,
    Passed,
    Failed,
    Quit,
}

impl fmt::Display for SpectatedUserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A gameplay modifier with its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMod {
    pub acronym: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, Value>,
}

impl ApiMod {
    /// A mod without settings.
    #[must_use]
    pub fn new(acronym: impl Into<String>) -> Self {
        Self {
            acronym: acronym.into(),
            settings: BTreeMap::new(),
        }
    }
}

/// Snapshot of one user's play session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectatorState {
    pub beatmap_id: Option<i32>,
    pub ruleset_id: Option<i32>,
    #[serde(default)]
    pub mods: Vec<ApiMod>,
    #[serde(default)]
    pub state: SpectatedUserState,
}

/// Score summary sent along with each frame batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub total_score: i64,
    pub accuracy: f64,
    pub combo: i32,
    pub max_combo: i32,
    /// Milliseconds since the Unix epoch.
    pub received_time: i64,
}

/// One input sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayFrame {
    /// Gameplay time in milliseconds.
    pub time: f64,
    pub x: f32,
    pub y: f32,
    /// Pressed buttons as a bit set.
    pub buttons: u32,
}

/// A batch of frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameDataBundle {
    pub header: FrameHeader,
    pub frames: Vec<ReplayFrame>,
}

impl FrameDataBundle {
    #[must_use]
    pub fn new(header: FrameHeader, frames: Vec<ReplayFrame>) -> Self {
        Self { header, frames }
    }
}
