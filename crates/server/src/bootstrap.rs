use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use skaldi_core::config::Config;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("required tool '{0}' not found in PATH")]
    MissingTool(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Installed helper versions, persisted as `versions.json` in the cache dir.
/// A missing or corrupt file just resets to empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionState {
    pub uv: String,
    pub bun: String,
    #[serde(rename = "yt-dlp")]
    pub yt_dlp: String,
}

impl VersionState {
    pub fn load(cache_dir: &Path) -> Self {
        let path = cache_dir.join("versions.json");
        match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt version state, resetting");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, cache_dir: &Path) -> Result<(), BootstrapError> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(cache_dir.join("versions.json"), data)?;
        Ok(())
    }
}

/// Startup checks and filesystem preparation. Helper download/extraction is
/// a separate concern; here we only verify the player is runnable, create
/// the directory layout, refresh the recorded yt-dlp version, and regenerate
/// the shim.
pub fn prepare(cfg: &Config) -> Result<(), BootstrapError> {
    check_prerequisites()?;

    for dir in [&cfg.cache_dir, &cfg.bin_dir, &cfg.uv_bin_dir, &cfg.history_dir] {
        std::fs::create_dir_all(dir)?;
    }

    let mut state = VersionState::load(&cfg.cache_dir);
    if let Some(version) = ytdlp_version(&cfg.real_ytdlp_path()) {
        if state.yt_dlp != version {
            debug!(version, "recording yt-dlp version");
            state.yt_dlp = version;
            if let Err(e) = state.save(&cfg.cache_dir) {
                warn!(error = %e, "failed to save version state");
            }
        }
    }

    write_shim(cfg)?;
    Ok(())
}

pub fn check_prerequisites() -> Result<(), BootstrapError> {
    for tool in ["mpv", "ffmpeg"] {
        if find_in_path(tool).is_none() {
            return Err(BootstrapError::MissingTool(tool.to_string()));
        }
    }
    Ok(())
}

pub(crate) fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn ytdlp_version(path: &Path) -> Option<String> {
    let output = std::process::Command::new(path).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// The player invokes this script in place of yt-dlp; it pins the managed
/// binary and its JS runtime.
fn write_shim(cfg: &Config) -> Result<(), BootstrapError> {
    let content = format!(
        "#!/bin/sh\nexec \"{}\" --js-runtimes \"bun:{}\" \"$@\"\n",
        cfg.real_ytdlp_path().display(),
        cfg.bun_path().display()
    );

    let shim = cfg.shim_path();
    std::fs::write(&shim, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            cache_dir: dir.path().to_path_buf(),
            bin_dir: dir.path().join("bin"),
            uv_bin_dir: dir.path().join("uv-bin"),
            socket_path: dir.path().join("mpv.sock"),
            history_dir: dir.path().join("history"),
            player_bin: PathBuf::from("mpv"),
        }
    }

    #[test]
    fn version_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = VersionState {
            uv: "0.5.1".into(),
            bun: "1.1.0".into(),
            yt_dlp: "2025.01.15".into(),
        };
        state.save(dir.path()).unwrap();

        let loaded = VersionState::load(dir.path());
        assert_eq!(loaded.uv, "0.5.1");
        assert_eq!(loaded.bun, "1.1.0");
        assert_eq!(loaded.yt_dlp, "2025.01.15");

        // the on-disk key is "yt-dlp", not "yt_dlp"
        let raw = std::fs::read_to_string(dir.path().join("versions.json")).unwrap();
        assert!(raw.contains("\"yt-dlp\""));
    }

    #[test]
    fn missing_state_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = VersionState::load(dir.path());
        assert!(state.uv.is_empty());
        assert!(state.yt_dlp.is_empty());
    }

    #[test]
    fn corrupt_state_file_resets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("versions.json"), b"{not json").unwrap();
        let state = VersionState::load(dir.path());
        assert!(state.bun.is_empty());
    }

    #[test]
    fn shim_points_at_managed_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(&dir);
        std::fs::create_dir_all(&cfg.bin_dir).unwrap();

        write_shim(&cfg).unwrap();

        let content = std::fs::read_to_string(cfg.shim_path()).unwrap();
        assert!(content.starts_with("#!/bin/sh"));
        assert!(content.contains(&cfg.real_ytdlp_path().display().to_string()));
        assert!(content.contains(&cfg.bun_path().display().to_string()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(cfg.shim_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o755, 0o755);
        }
    }

    #[test]
    fn find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-tool-xyz").is_none());
    }
}
