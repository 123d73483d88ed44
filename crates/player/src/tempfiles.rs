use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Uploaded files live outside the player's control; this registry keeps
/// every path alive exactly as long as the playlist references it.
pub struct TempFileRegistry {
    paths: Mutex<HashSet<PathBuf>>,
}

impl Default for TempFileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TempFileRegistry {
    pub fn new() -> Self {
        Self {
            paths: Mutex::new(HashSet::new()),
        }
    }

    pub async fn register(&self, path: PathBuf) {
        self.paths.lock().await.insert(path);
    }

    /// Forget and unlink one path (enqueue failed, nothing references it).
    pub async fn discard(&self, path: &Path) {
        self.paths.lock().await.remove(path);
        unlink(path);
    }

    /// Unlink every registered path no longer present in the playlist.
    pub async fn prune_against(&self, playlist_filenames: &HashSet<String>) {
        let mut paths = self.paths.lock().await;
        if paths.is_empty() {
            return;
        }

        let stale: Vec<PathBuf> = paths
            .iter()
            .filter(|p| !playlist_filenames.contains(&p.to_string_lossy().into_owned()))
            .cloned()
            .collect();

        for path in stale {
            paths.remove(&path);
            unlink(&path);
        }
    }

    /// Shutdown path: everything goes.
    pub async fn cleanup_all(&self) {
        let mut paths = self.paths.lock().await;
        for path in paths.drain() {
            unlink(&path);
        }
    }

    pub async fn len(&self) -> usize {
        self.paths.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.paths.lock().await.is_empty()
    }
}

fn unlink(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed temp file"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp file"),
    }
}
