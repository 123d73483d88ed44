use std::path::PathBuf;

/// Filesystem layout and helper locations shared by every subsystem.
///
/// Everything lives under two roots: a cache directory (managed binaries,
/// the player's IPC socket, version state) and a data directory (play
/// history). Both are overridable through `SKALDI_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub uv_bin_dir: PathBuf,
    pub socket_path: PathBuf,
    pub history_dir: PathBuf,
    /// Player binary, resolved through `PATH` unless overridden.
    pub player_bin: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot determine home directory (set HOME, or SKALDI_CACHE_DIR and SKALDI_DATA_DIR)")]
    NoHome,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let cache_dir = match std::env::var_os("SKALDI_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => user_cache_dir()?.join("skaldi"),
        };

        let data_dir = match std::env::var_os("SKALDI_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => user_data_dir()?.join("skaldi"),
        };

        let player_bin = std::env::var_os("SKALDI_PLAYER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("mpv"));

        Ok(Self {
            bin_dir: cache_dir.join("bin"),
            uv_bin_dir: cache_dir.join("uv-bin"),
            socket_path: cache_dir.join("mpv.sock"),
            history_dir: data_dir.join("history"),
            cache_dir,
            player_bin,
        })
    }

    pub fn uv_path(&self) -> PathBuf {
        self.bin_dir.join("uv")
    }

    pub fn bun_path(&self) -> PathBuf {
        self.bin_dir.join("bun")
    }

    /// The generated shim the player invokes in place of yt-dlp.
    pub fn shim_path(&self) -> PathBuf {
        self.bin_dir.join("yt-dlp")
    }

    pub fn real_ytdlp_path(&self) -> PathBuf {
        self.uv_bin_dir.join("yt-dlp")
    }
}

fn user_cache_dir() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME") {
        return Ok(PathBuf::from(dir));
    }
    home_dir().map(|home| home.join(".cache"))
}

fn user_data_dir() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        return Ok(PathBuf::from(dir));
    }
    home_dir().map(|home| home.join(".local").join("share"))
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or(ConfigError::NoHome)
}
