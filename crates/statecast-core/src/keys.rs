//! Well-known stream keys.

pub const USER_INFO: &str = "user.info";
pub const USER_ACTIVITY: &str = "user.activity";
pub const USER_STATISTIC: &str = "user.statistic";

pub const GAME_MODS: &str = "game.mods";
pub const GAME_RULESET: &str = "game.ruleset";
pub const GAME_BEATMAP: &str = "game.beatmap";

pub const PLAY_PP: &str = "play.pp";
pub const PLAY_INPUT: &str = "play.input";
pub const PLAY_CLOCK: &str = "play.clock";
pub const PLAY_COMBO: &str = "play.combo";
pub const PLAY_SCORE: &str = "play.score";
pub const PLAY_HEALTH: &str = "play.health";
pub const PLAY_ACCURACY: &str = "play.accuracy";
