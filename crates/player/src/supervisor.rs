use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use skaldi_core::config::Config;
use skaldi_core::types::{Snapshot, Track};
use skaldi_history::HistorySink;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::events::EventRouter;
use crate::ipc::IpcClient;
use crate::state::PlaybackState;
use crate::tempfiles::TempFileRegistry;
use crate::PlayerError;

/// Capacity of the snapshot update channel feeding the broadcaster.
pub const UPDATE_BUFFER: usize = 100;

const OBSERVED_PROPERTIES: [&str; 9] = [
    "idle-active",
    "pause",
    "time-pos",
    "duration",
    "volume",
    "mute",
    "playlist",
    "media-title",
    "playlist-pos",
];

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RESTART_DELAY: Duration = Duration::from_secs(1);
const FAILED_START_DELAY: Duration = Duration::from_secs(2);
const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns the player subprocess, its IPC connection, the state mirror, and the
/// auxiliary registries. `run` supervises until `stop` is called, restarting
/// the player on unexpected exits.
pub struct Manager {
    cfg: Arc<Config>,
    ipc: IpcClient,
    state: Arc<PlaybackState>,
    temp_files: Arc<TempFileRegistry>,
    child: Mutex<Option<Child>>,
    stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Manager {
    pub fn new(cfg: Arc<Config>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            ipc: IpcClient::new(cfg.socket_path.clone()),
            state: Arc::new(PlaybackState::new()),
            temp_files: Arc::new(TempFileRegistry::new()),
            child: Mutex::new(None),
            stopping: AtomicBool::new(false),
            shutdown,
            cfg,
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot()
    }

    /// Metadata must land before `loadfile`, so the playlist event that
    /// follows can hydrate the new entry.
    pub fn store_metadata(&self, key: String, track: Track) {
        self.state.store_metadata(key, track);
    }

    pub async fn register_temp_file(&self, path: PathBuf) {
        self.temp_files.register(path).await;
    }

    pub async fn discard_temp_file(&self, path: &Path) {
        self.temp_files.discard(path).await;
    }

    pub async fn exec(&self, command: Value) -> Result<Value, PlayerError> {
        self.ipc.exec(command).await
    }

    /// Jump to `target` without reordering the tracks between the current
    /// one and the target relative to each other: rotate each intermediate
    /// item to the tail, then play the item now sitting right after the
    /// current one.
    pub async fn play_index(&self, target: usize) -> Result<(), PlayerError> {
        let current = self
            .ipc
            .exec(json!(["get_property", "playlist-pos"]))
            .await?
            .as_f64()
            .map(|v| v as i64)
            .unwrap_or(-1);

        let target = target as i64;
        if current < 0 || target <= current {
            self.ipc
                .exec(json!(["playlist-play-index", target]))
                .await?;
            return Ok(());
        }

        for _ in (current + 1)..target {
            self.ipc
                .exec(json!(["playlist-move", current + 1, -1]))
                .await?;
        }
        self.ipc
            .exec(json!(["playlist-play-index", current + 1]))
            .await?;
        Ok(())
    }

    /// Supervision loop. Returns after `stop`; the update channel (whose
    /// sole sender lives in the event router) is closed on the way out, then
    /// temp files are released exactly once.
    pub async fn run(self: Arc<Self>, updates: mpsc::Sender<Snapshot>, history: HistorySink) {
        let router = EventRouter {
            state: Arc::clone(&self.state),
            temp_files: Arc::clone(&self.temp_files),
            history,
            updates,
        }
        .spawn(self.ipc.subscribe(), self.shutdown.subscribe());

        self.supervise().await;

        let _ = self.shutdown.send(true);
        let _ = router.await;
        self.temp_files.cleanup_all().await;
        debug!("player manager stopped");
    }

    /// Bounded shutdown: flag first, a best-effort `quit`, close the
    /// transport, then signal every waiter. Idempotent.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping player");
        let _ = tokio::time::timeout(QUIT_TIMEOUT, self.ipc.exec(json!(["quit"]))).await;
        self.ipc.close().await;
        let _ = self.shutdown.send(true);
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    async fn supervise(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.stopping() {
                return;
            }

            match self.start().await {
                Ok(()) => {
                    self.wait_for_exit(&mut shutdown).await;
                    if self.stopping() {
                        return;
                    }
                    warn!("player exited unexpectedly, restarting");
                    if sleep_or_shutdown(RESTART_DELAY, &mut shutdown).await {
                        return;
                    }
                }
                Err(e) => {
                    if self.stopping() {
                        return;
                    }
                    warn!(error = %e, "failed to start player");
                    if sleep_or_shutdown(FAILED_START_DELAY, &mut shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    async fn start(&self) -> Result<(), PlayerError> {
        let socket = &self.cfg.socket_path;
        if socket.exists() {
            let _ = std::fs::remove_file(socket);
        }

        let args = [
            "--idle=yes".to_string(),
            "--no-video".to_string(),
            "--no-terminal".to_string(),
            format!("--input-ipc-server={}", socket.display()),
            "--ytdl-format=bestaudio/best".to_string(),
            "--af=dynaudnorm".to_string(),
            format!(
                "--script-opts=ytdl_hook-ytdl_path={}",
                self.cfg.shim_path().display()
            ),
            format!(
                "--ytdl-raw-options=js-runtimes=bun:{}",
                self.cfg.bun_path().display()
            ),
        ];

        debug!(player = %self.cfg.player_bin.display(), ?args, "starting player");
        let child = Command::new(&self.cfg.player_bin)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        *self.child.lock().await = Some(child);

        if let Err(e) = self.wait_for_socket().await {
            self.kill_child().await;
            return Err(e);
        }
        if let Err(e) = self.ipc.connect().await {
            self.kill_child().await;
            return Err(e);
        }

        self.register_observers().await;
        info!("player started");
        Ok(())
    }

    async fn wait_for_socket(&self) -> Result<(), PlayerError> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.stopping() {
                return Err(PlayerError::Closed);
            }
            if self.cfg.socket_path.exists() {
                return Ok(());
            }

            {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => {
                        if let Ok(Some(_)) = child.try_wait() {
                            *guard = None;
                            return Err(PlayerError::PrematureExit);
                        }
                    }
                    None => return Err(PlayerError::PrematureExit),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(SOCKET_POLL_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn wait_for_exit(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if *shutdown.borrow() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            } else {
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) if !self.stopping() => {
                            warn!(%status, "player exited");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "failed waiting on player"),
                    },
                    _ = shutdown.changed() => {
                        // quit was already sent over IPC; make sure anyway.
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
            }
        }
        *guard = None;
    }

    async fn kill_child(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        *guard = None;
    }

    async fn register_observers(&self) {
        for property in OBSERVED_PROPERTIES {
            if let Err(e) = self
                .ipc
                .exec(json!(["observe_property", 0, property]))
                .await
            {
                warn!(property, error = %e, "failed to observe property");
            }
        }
    }
}

async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
