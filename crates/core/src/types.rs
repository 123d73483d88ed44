use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse playback state derived from the player's `idle-active` and `pause`
/// properties: idle wins, then paused, else playing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Playing,
    Paused,
}

impl PlaybackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Playing => "playing",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Track descriptor produced by the URL resolver (or synthesised for local
/// uploads). Optional fields stay empty rather than `None` to match the wire
/// shape expected by the browser client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Track {
    pub title: String,
    pub artist: String,
    pub duration: f64,
    pub uploader: String,
    pub thumbnail: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub webpage_url: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_music: bool,
}

/// One entry of the player's `playlist` property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistEntry {
    pub filename: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub current: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub playing: bool,
    pub id: i64,
}

/// A playlist entry rendered for clients, hydrated with cached metadata when
/// the filename has any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueItem {
    pub index: usize,
    pub filename: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "f64_is_zero")]
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Track>,
}

/// Immutable projection of the playback state at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    #[serde(rename = "v")]
    pub version: u64,
    pub status: PlaybackStatus,
    pub current_time: f64,
    pub duration: f64,
    pub queue: Vec<QueueItem>,
    pub history: Vec<QueueItem>,
    pub upcoming: Vec<QueueItem>,
    pub current_index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now_playing: Option<QueueItem>,
}

/// Minimal field set that transforms one snapshot into a later one when both
/// share the same queue. Absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delta {
    #[serde(rename = "v")]
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PlaybackStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_index: Option<i64>,
}

/// One "track became current" record, appended to the daily play log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artist: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_url: String,
}

fn f64_is_zero(v: &f64) -> bool {
    *v == 0.0
}
