use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use skaldi_core::types::{PlaylistEntry, Snapshot};
use skaldi_history::HistorySink;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ipc::PlayerEvent;
use crate::state::PlaybackState;
use crate::tempfiles::TempFileRegistry;

/// Metadata for tracks that fell out of the playlist lingers briefly, so an
/// enqueue racing a playlist event cannot lose its freshly stored entry.
const METADATA_GRACE_MINUTES: i64 = 5;

/// Applies player events to the state mirror and pushes a snapshot onto the
/// update channel after every observable change. The update sender lives
/// here and nowhere else, so the channel closes when the router exits.
pub(crate) struct EventRouter {
    pub state: Arc<PlaybackState>,
    pub temp_files: Arc<TempFileRegistry>,
    pub history: HistorySink,
    pub updates: mpsc::Sender<Snapshot>,
}

impl EventRouter {
    pub fn spawn(
        self,
        mut events: broadcast::Receiver<PlayerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = events.recv() => match received {
                        Ok(event) => self.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "event stream lagged, oldest events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("event router stopped");
        })
    }

    async fn handle_event(&self, event: PlayerEvent) {
        if event.event != "property-change" {
            return;
        }

        let changed = match event.name.as_str() {
            "idle-active" => self.apply_idle(event.data),
            "pause" => self.apply_paused(event.data),
            "time-pos" => self.apply_time_pos(event.data),
            "duration" => self.apply_duration(event.data),
            "volume" => self.apply_volume(event.data),
            "mute" => self.apply_muted(event.data),
            "playlist" => self.apply_playlist(event.data).await,
            "playlist-pos" => self.apply_playlist_pos(event.data),
            _ => false,
        };

        if changed && self.updates.try_send(self.state.snapshot()).is_err() {
            // Full (or closing down): the next event supersedes this one.
            debug!("update channel full, dropping snapshot");
        }
    }

    fn apply_idle(&self, data: Value) -> bool {
        let Some(idle) = data.as_bool() else {
            return false;
        };
        let changed = self.state.set_idle(idle);
        if idle {
            self.state.set_time_pos(0.0);
            self.state.set_duration(0.0);
        }
        changed
    }

    fn apply_paused(&self, data: Value) -> bool {
        data.as_bool()
            .map(|paused| self.state.set_paused(paused))
            .unwrap_or(false)
    }

    fn apply_time_pos(&self, data: Value) -> bool {
        // null while idle; nothing to mirror then.
        data.as_f64()
            .map(|t| self.state.set_time_pos(t))
            .unwrap_or(false)
    }

    fn apply_duration(&self, data: Value) -> bool {
        data.as_f64()
            .map(|d| self.state.set_duration(d))
            .unwrap_or(false)
    }

    fn apply_volume(&self, data: Value) -> bool {
        data.as_f64()
            .map(|v| self.state.set_volume(v))
            .unwrap_or(false)
    }

    fn apply_muted(&self, data: Value) -> bool {
        data.as_bool()
            .map(|m| self.state.set_muted(m))
            .unwrap_or(false)
    }

    async fn apply_playlist(&self, data: Value) -> bool {
        let entries: Vec<PlaylistEntry> = match serde_json::from_value(data) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "unparseable playlist payload");
                return false;
            }
        };

        let changed = self.state.set_playlist(entries);
        self.state
            .prune_metadata(Some(Utc::now() - Duration::minutes(METADATA_GRACE_MINUTES)));
        self.temp_files
            .prune_against(&self.state.playlist_filenames())
            .await;
        changed
    }

    fn apply_playlist_pos(&self, data: Value) -> bool {
        let pos = data.as_f64().map(|v| v as i64).unwrap_or(-1);
        let changed = self.state.set_playlist_pos(pos);
        if changed && pos >= 0 {
            if let Some(entry) = self.state.history_entry_for_current() {
                self.history.log(entry);
            }
        }
        changed
    }
}
