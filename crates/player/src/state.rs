use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use skaldi_core::types::{
    Delta, HistoryEntry, PlaybackStatus, PlaylistEntry, QueueItem, Snapshot, Track,
};

/// Mirror of the player's observable state. Only the event router and the
/// command surface write; snapshots are taken by anyone. Setters report
/// whether they changed something a subscriber could observe.
pub struct PlaybackState {
    inner: RwLock<Inner>,
}

struct Inner {
    version: u64,
    idle: bool,
    paused: bool,
    time_pos: f64,
    duration: f64,
    volume: f64,
    muted: bool,
    playlist: Vec<PlaylistEntry>,
    playlist_pos: i64,
    metadata: HashMap<String, Track>,
    metadata_inserted_at: HashMap<String, DateTime<Utc>>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                version: 0,
                idle: true,
                paused: false,
                time_pos: 0.0,
                duration: 0.0,
                volume: 0.0,
                muted: false,
                playlist: Vec::new(),
                playlist_pos: -1,
                metadata: HashMap::new(),
                metadata_inserted_at: HashMap::new(),
            }),
        }
    }

    pub fn set_idle(&self, idle: bool) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.idle == idle {
            return false;
        }
        inner.idle = idle;
        inner.version += 1;
        true
    }

    pub fn set_paused(&self, paused: bool) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.paused == paused {
            return false;
        }
        inner.paused = paused;
        inner.version += 1;
        true
    }

    /// Position ticks never bump the version; deltas still carry them.
    pub fn set_time_pos(&self, time_pos: f64) -> bool {
        let mut inner = self.inner.write().unwrap();
        inner.time_pos = time_pos;
        true
    }

    /// Also folds the duration back into the current entry's cached track,
    /// so resolver estimates get replaced by what the player measured.
    pub fn set_duration(&self, duration: f64) -> bool {
        let mut inner = self.inner.write().unwrap();
        inner.duration = duration;

        let pos = inner.playlist_pos;
        if pos >= 0 && (pos as usize) < inner.playlist.len() {
            let filename = inner.playlist[pos as usize].filename.clone();
            if let Some(track) = inner.metadata.get_mut(&filename) {
                track.duration = duration;
            }
        }
        true
    }

    pub fn set_volume(&self, volume: f64) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.volume == volume {
            return false;
        }
        inner.volume = volume;
        true
    }

    pub fn set_muted(&self, muted: bool) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.muted == muted {
            return false;
        }
        inner.muted = muted;
        true
    }

    pub fn set_playlist(&self, entries: Vec<PlaylistEntry>) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.playlist == entries {
            return false;
        }
        inner.playlist = entries;
        inner.version += 1;
        true
    }

    /// A position change means a different track; stale time/duration from
    /// the previous one must never be reported.
    pub fn set_playlist_pos(&self, pos: i64) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.playlist_pos == pos {
            return false;
        }
        inner.playlist_pos = pos;
        inner.time_pos = 0.0;
        inner.duration = 0.0;
        inner.version += 1;
        true
    }

    pub fn store_metadata(&self, key: String, track: Track) -> bool {
        let mut inner = self.inner.write().unwrap();
        inner.metadata_inserted_at.insert(key.clone(), Utc::now());
        inner.metadata.insert(key, track);
        inner.version += 1;
        true
    }

    /// Drop metadata whose key is absent from the playlist and (when a cutoff
    /// is given) was inserted before it. `None` removes all stale entries.
    /// Keys in the playlist always survive. Pruned entries were never
    /// rendered, so the version stays put.
    pub fn prune_metadata(&self, cutoff: Option<DateTime<Utc>>) -> usize {
        let mut inner = self.inner.write().unwrap();

        let in_playlist: HashSet<&str> = inner
            .playlist
            .iter()
            .map(|e| e.filename.as_str())
            .collect();

        let stale: Vec<String> = inner
            .metadata
            .keys()
            .filter(|key| !in_playlist.contains(key.as_str()))
            .filter(|key| match cutoff {
                Some(cutoff) => inner
                    .metadata_inserted_at
                    .get(*key)
                    .map_or(true, |at| *at < cutoff),
                None => true,
            })
            .cloned()
            .collect();

        for key in &stale {
            inner.metadata.remove(key);
            inner.metadata_inserted_at.remove(key);
        }
        stale.len()
    }

    /// Filenames currently in the playlist, for temp-file reconciliation.
    pub fn playlist_filenames(&self) -> HashSet<String> {
        let inner = self.inner.read().unwrap();
        inner
            .playlist
            .iter()
            .map(|e| e.filename.clone())
            .collect()
    }

    /// Build the play-history record for the current entry, if any. Falls
    /// back to the bare filename when no metadata is cached.
    pub fn history_entry_for_current(&self) -> Option<HistoryEntry> {
        let inner = self.inner.read().unwrap();
        let pos = inner.playlist_pos;
        if pos < 0 || pos as usize >= inner.playlist.len() {
            return None;
        }

        let filename = &inner.playlist[pos as usize].filename;
        let entry = match inner.metadata.get(filename) {
            Some(track) => {
                let source_url = if !track.webpage_url.is_empty() {
                    track.webpage_url.clone()
                } else {
                    track.url.clone()
                };
                HistoryEntry {
                    timestamp: Utc::now(),
                    title: track.title.clone(),
                    artist: track.artist.clone(),
                    source_url,
                }
            }
            None => HistoryEntry {
                timestamp: Utc::now(),
                title: filename.clone(),
                artist: String::new(),
                source_url: String::new(),
            },
        };

        if entry.title.is_empty() && entry.source_url.is_empty() {
            return None;
        }
        Some(entry)
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().unwrap();

        let status = if inner.idle {
            PlaybackStatus::Idle
        } else if inner.paused {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Playing
        };

        // playlist-pos is authoritative; the entry's `current` flag is only a
        // fallback when the reported position is out of range.
        let mut current_index: i64 = -1;
        if inner.playlist_pos >= 0 && (inner.playlist_pos as usize) < inner.playlist.len() {
            current_index = inner.playlist_pos;
        } else if let Some(i) = inner.playlist.iter().position(|e| e.current) {
            current_index = i as i64;
        }

        let mut queue = Vec::with_capacity(inner.playlist.len());
        let mut history = Vec::new();
        let mut upcoming = Vec::new();
        let mut now_playing = None;

        for (i, entry) in inner.playlist.iter().enumerate() {
            let mut item = QueueItem {
                index: i,
                filename: entry.filename.clone(),
                title: String::new(),
                duration: 0.0,
                metadata: None,
            };
            if let Some(track) = inner.metadata.get(&entry.filename) {
                item.title = track.title.clone();
                item.duration = track.duration;
                item.metadata = Some(track.clone());
            }

            let i = i as i64;
            if current_index >= 0 && i < current_index {
                history.push(item.clone());
            } else if current_index >= 0 && i == current_index {
                now_playing = Some(item.clone());
            } else {
                upcoming.push(item.clone());
            }
            queue.push(item);
        }

        Snapshot {
            version: inner.version,
            status,
            current_time: inner.time_pos,
            duration: inner.duration,
            queue,
            history,
            upcoming,
            current_index,
            now_playing,
        }
    }
}

/// Structural queue comparison used to decide delta vs full snapshot.
pub fn queue_changed(a: &[QueueItem], b: &[QueueItem]) -> bool {
    if a.len() != b.len() {
        return true;
    }
    a.iter().zip(b).any(|(x, y)| {
        x.filename != y.filename || x.title != y.title || x.duration != y.duration
    })
}

/// Minimal update from `prev` to `curr`, or `None` when either a full
/// snapshot is required (never-sent subscriber, structural queue change) or
/// there is nothing to send at all. Callers distinguish the two cases with
/// [`queue_changed`] and `prev.version == 0`.
pub fn compute_delta(prev: &Snapshot, curr: &Snapshot) -> Option<Delta> {
    if prev.version == 0 {
        return None;
    }

    if curr.version != prev.version {
        if queue_changed(&prev.queue, &curr.queue) {
            return None;
        }
        return Some(Delta {
            version: curr.version,
            current_time: Some(curr.current_time),
            duration: Some(curr.duration),
            status: Some(curr.status),
            current_index: Some(curr.current_index),
        });
    }

    if curr.current_time == prev.current_time && curr.duration == prev.duration {
        return None;
    }

    let mut delta = Delta {
        version: curr.version,
        ..Default::default()
    };
    if curr.current_time != prev.current_time {
        delta.current_time = Some(curr.current_time);
    }
    if curr.duration != prev.duration {
        delta.duration = Some(curr.duration);
    }
    Some(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entries(names: &[&str]) -> Vec<PlaylistEntry> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| PlaylistEntry {
                filename: (*name).to_string(),
                id: i as i64 + 1,
                ..Default::default()
            })
            .collect()
    }

    fn track(title: &str, duration: f64) -> Track {
        Track {
            title: title.to_string(),
            duration,
            ..Default::default()
        }
    }

    #[test]
    fn new_state_is_idle_and_empty() {
        let state = PlaybackState::new();
        let snap = state.snapshot();
        assert_eq!(snap.version, 0);
        assert_eq!(snap.status, PlaybackStatus::Idle);
        assert_eq!(snap.current_index, -1);
        assert!(snap.now_playing.is_none());
        assert!(snap.queue.is_empty());
    }

    #[test]
    fn status_derivation() {
        let state = PlaybackState::new();
        assert_eq!(state.snapshot().status, PlaybackStatus::Idle);

        state.set_idle(false);
        assert_eq!(state.snapshot().status, PlaybackStatus::Playing);

        state.set_paused(true);
        assert_eq!(state.snapshot().status, PlaybackStatus::Paused);

        state.set_idle(true);
        assert_eq!(state.snapshot().status, PlaybackStatus::Idle);
    }

    #[test]
    fn versions_are_monotonic() {
        let state = PlaybackState::new();
        let mut last = state.snapshot().version;
        state.set_idle(false);
        state.set_playlist(entries(&["a", "b"]));
        state.set_playlist_pos(0);
        state.set_time_pos(3.0);
        state.store_metadata("a".into(), track("A", 10.0));
        for _ in 0..4 {
            let v = state.snapshot().version;
            assert!(v >= last);
            last = v;
        }
    }

    #[test]
    fn time_pos_does_not_bump_version() {
        let state = PlaybackState::new();
        let before = state.snapshot().version;
        state.set_time_pos(42.0);
        let snap = state.snapshot();
        assert_eq!(snap.version, before);
        assert_eq!(snap.current_time, 42.0);
    }

    #[test]
    fn reapplying_identical_playlist_keeps_version() {
        let state = PlaybackState::new();
        assert!(state.set_playlist(entries(&["a", "b"])));
        let v = state.snapshot().version;
        assert!(!state.set_playlist(entries(&["a", "b"])));
        assert_eq!(state.snapshot().version, v);
    }

    #[test]
    fn playlist_pos_change_resets_position() {
        let state = PlaybackState::new();
        state.set_playlist(entries(&["a", "b", "c"]));
        state.set_playlist_pos(0);
        state.set_time_pos(90.0);
        state.set_duration(120.0);

        assert!(state.set_playlist_pos(1));
        let snap = state.snapshot();
        assert_eq!(snap.current_index, 1);
        assert_eq!(snap.current_time, 0.0);
        assert_eq!(snap.duration, 0.0);
    }

    #[test]
    fn same_playlist_pos_is_a_no_op() {
        let state = PlaybackState::new();
        state.set_playlist(entries(&["a", "b"]));
        state.set_playlist_pos(1);
        state.set_time_pos(30.0);
        let v = state.snapshot().version;

        assert!(!state.set_playlist_pos(1));
        let snap = state.snapshot();
        assert_eq!(snap.version, v);
        assert_eq!(snap.current_time, 30.0);
    }

    #[test]
    fn snapshot_partitions_queue() {
        let state = PlaybackState::new();
        state.set_playlist(entries(&["a", "b", "c", "d"]));
        state.set_playlist_pos(1);
        state.store_metadata("b".into(), track("Track B", 200.0));

        let snap = state.snapshot();
        assert_eq!(snap.queue.len(), 4);
        assert_eq!(snap.current_index, 1);
        assert_eq!(snap.history.len(), 1);
        assert_eq!(snap.history[0].filename, "a");
        assert_eq!(snap.upcoming.len(), 2);
        assert_eq!(snap.upcoming[0].filename, "c");

        let now_playing = snap.now_playing.expect("now_playing should be set");
        assert_eq!(now_playing.title, "Track B");
        assert_eq!(now_playing.duration, 200.0);
        assert!(now_playing.metadata.is_some());
    }

    #[test]
    fn now_playing_absent_iff_no_current_index() {
        let state = PlaybackState::new();
        let snap = state.snapshot();
        assert_eq!(snap.current_index, -1);
        assert!(snap.now_playing.is_none());

        state.set_playlist(entries(&["a"]));
        state.set_playlist_pos(0);
        let snap = state.snapshot();
        assert_eq!(snap.current_index, 0);
        assert!(snap.now_playing.is_some());
    }

    #[test]
    fn current_flag_is_fallback_when_pos_out_of_range() {
        let state = PlaybackState::new();
        let mut list = entries(&["a", "b", "c"]);
        list[2].current = true;
        state.set_playlist(list);
        // playlist_pos still -1: fall back to the flagged entry
        let snap = state.snapshot();
        assert_eq!(snap.current_index, 2);

        // an in-range playlist-pos wins over the flag
        state.set_playlist_pos(0);
        assert_eq!(state.snapshot().current_index, 0);
    }

    #[test]
    fn duration_feeds_back_into_current_track() {
        let state = PlaybackState::new();
        state.set_playlist(entries(&["a"]));
        state.set_playlist_pos(0);
        state.store_metadata("a".into(), track("A", 100.0));

        state.set_duration(187.3);
        let snap = state.snapshot();
        assert_eq!(snap.queue[0].duration, 187.3);
    }

    #[test]
    fn prune_keeps_playlist_entries() {
        let state = PlaybackState::new();
        state.store_metadata("a".into(), track("A", 1.0));
        state.store_metadata("b".into(), track("B", 2.0));
        state.store_metadata("c".into(), track("C", 3.0));
        state.set_playlist(entries(&["a", "c"]));

        let removed = state.prune_metadata(None);
        assert_eq!(removed, 1);

        let snap = state.snapshot();
        assert_eq!(snap.queue[0].title, "A");
        assert_eq!(snap.queue[1].title, "C");
    }

    #[test]
    fn prune_respects_grace_period() {
        let state = PlaybackState::new();
        state.store_metadata("fresh".into(), track("Fresh", 1.0));
        state.set_playlist(entries(&["other"]));

        // Inserted just now, so a cutoff in the past keeps it.
        let removed = state.prune_metadata(Some(Utc::now() - Duration::minutes(5)));
        assert_eq!(removed, 0);

        // A cutoff in the future removes it.
        let removed = state.prune_metadata(Some(Utc::now() + Duration::minutes(1)));
        assert_eq!(removed, 1);
    }

    #[test]
    fn history_entry_prefers_metadata() {
        let state = PlaybackState::new();
        state.set_playlist(entries(&["https://ex/t1"]));
        state.set_playlist_pos(0);
        state.store_metadata(
            "https://ex/t1".into(),
            Track {
                title: "T1".into(),
                artist: "A1".into(),
                webpage_url: "https://ex/t1".into(),
                ..Default::default()
            },
        );

        let entry = state.history_entry_for_current().unwrap();
        assert_eq!(entry.title, "T1");
        assert_eq!(entry.artist, "A1");
        assert_eq!(entry.source_url, "https://ex/t1");
    }

    #[test]
    fn history_entry_falls_back_to_filename() {
        let state = PlaybackState::new();
        state.set_playlist(entries(&["/tmp/upload.mp3"]));
        state.set_playlist_pos(0);

        let entry = state.history_entry_for_current().unwrap();
        assert_eq!(entry.title, "/tmp/upload.mp3");
        assert!(entry.artist.is_empty());
    }

    #[test]
    fn history_entry_none_without_current() {
        let state = PlaybackState::new();
        assert!(state.history_entry_for_current().is_none());
    }

    #[test]
    fn delta_never_sent_forces_full() {
        let prev = Snapshot::default();
        let curr = Snapshot {
            version: 3,
            ..Default::default()
        };
        assert!(compute_delta(&prev, &curr).is_none());
    }

    #[test]
    fn delta_for_time_tick_only() {
        let prev = Snapshot {
            version: 7,
            current_time: 12.0,
            duration: 180.0,
            ..Default::default()
        };
        let curr = Snapshot {
            version: 7,
            current_time: 13.5,
            duration: 180.0,
            ..Default::default()
        };

        let delta = compute_delta(&prev, &curr).unwrap();
        assert_eq!(delta.version, 7);
        assert_eq!(delta.current_time, Some(13.5));
        assert!(delta.duration.is_none());
        assert!(delta.status.is_none());
        assert!(delta.current_index.is_none());
    }

    #[test]
    fn delta_on_version_bump_with_same_queue() {
        let queue = vec![QueueItem {
            index: 0,
            filename: "a".into(),
            title: "A".into(),
            duration: 100.0,
            metadata: None,
        }];
        let prev = Snapshot {
            version: 7,
            status: PlaybackStatus::Playing,
            current_time: 12.0,
            duration: 100.0,
            queue: queue.clone(),
            current_index: 0,
            ..Default::default()
        };
        let curr = Snapshot {
            version: 8,
            status: PlaybackStatus::Paused,
            current_time: 13.5,
            duration: 100.0,
            queue,
            current_index: 0,
            ..Default::default()
        };

        let delta = compute_delta(&prev, &curr).unwrap();
        assert_eq!(delta.version, 8);
        assert_eq!(delta.current_time, Some(13.5));
        assert_eq!(delta.duration, Some(100.0));
        assert_eq!(delta.status, Some(PlaybackStatus::Paused));
        assert_eq!(delta.current_index, Some(0));
    }

    #[test]
    fn queue_growth_forces_full_snapshot() {
        let prev = Snapshot {
            version: 7,
            queue: vec![QueueItem {
                index: 0,
                filename: "a".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let curr = Snapshot {
            version: 8,
            queue: vec![
                QueueItem {
                    index: 0,
                    filename: "a".into(),
                    ..Default::default()
                },
                QueueItem {
                    index: 1,
                    filename: "b".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(compute_delta(&prev, &curr).is_none());
        assert!(queue_changed(&prev.queue, &curr.queue));
    }

    #[test]
    fn nothing_changed_yields_no_delta() {
        let snap = Snapshot {
            version: 5,
            current_time: 10.0,
            ..Default::default()
        };
        assert!(compute_delta(&snap, &snap.clone()).is_none());
        assert!(!queue_changed(&snap.queue, &snap.queue));
    }

    #[test]
    fn applying_delta_reconstructs_projected_fields() {
        let queue = vec![QueueItem {
            index: 0,
            filename: "a".into(),
            title: "A".into(),
            duration: 60.0,
            metadata: None,
        }];
        let prev = Snapshot {
            version: 4,
            status: PlaybackStatus::Playing,
            current_time: 1.0,
            duration: 60.0,
            queue: queue.clone(),
            current_index: 0,
            ..Default::default()
        };
        let curr = Snapshot {
            version: 5,
            status: PlaybackStatus::Paused,
            current_time: 9.0,
            duration: 60.0,
            queue,
            current_index: 0,
            ..Default::default()
        };

        let delta = compute_delta(&prev, &curr).unwrap();
        let mut applied = prev.clone();
        applied.version = delta.version;
        if let Some(t) = delta.current_time {
            applied.current_time = t;
        }
        if let Some(d) = delta.duration {
            applied.duration = d;
        }
        if let Some(s) = delta.status {
            applied.status = s;
        }
        if let Some(i) = delta.current_index {
            applied.current_index = i;
        }

        assert_eq!(applied.version, curr.version);
        assert_eq!(applied.current_time, curr.current_time);
        assert_eq!(applied.duration, curr.duration);
        assert_eq!(applied.status, curr.status);
        assert_eq!(applied.current_index, curr.current_index);
    }
}
