pub mod events;
pub mod ipc;
pub mod state;
pub mod supervisor;
pub mod tempfiles;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("player socket unreachable at {0}")]
    Unreachable(PathBuf),
    #[error("player connection closed")]
    Closed,
    #[error("timed out waiting for player reply")]
    Timeout,
    #[error("player error: {0}")]
    Remote(String),
    #[error("player exited before its socket appeared")]
    PrematureExit,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub use state::PlaybackState;
pub use supervisor::Manager;
