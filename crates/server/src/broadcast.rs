use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use skaldi_core::types::Snapshot;
use skaldi_player::state::{compute_delta, queue_changed};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Per-subscriber outbound queue depth. A slow client loses intermediate
/// updates, never its consistency: `last_delivered` only advances on
/// successful sends, so the next delivery is computed against what the
/// client actually has.
pub const SUBSCRIBER_BUFFER: usize = 10;

struct Subscriber {
    queue: mpsc::Sender<String>,
    last_delivered: Snapshot,
}

/// Fans playback snapshots out to streaming clients, as a minimal delta when
/// the subscriber's queue is structurally unchanged and as a full snapshot
/// otherwise.
pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a client. `initial` is what the client has already been
    /// sent; deltas start from there.
    pub async fn subscribe(&self, initial: Snapshot) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().await.insert(
            id,
            Subscriber {
                queue: tx,
                last_delivered: initial,
            },
        );
        (id, rx)
    }

    /// Closes the subscriber's queue.
    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().await.remove(&id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Consumes the update channel until the player side closes it.
    pub async fn run(self: Arc<Self>, mut updates: mpsc::Receiver<Snapshot>) {
        while let Some(snapshot) = updates.recv().await {
            self.fan_out(&snapshot).await;
        }
        debug!("update channel closed, broadcaster stopped");
    }

    async fn fan_out(&self, snapshot: &Snapshot) {
        let mut subscribers = self.subscribers.lock().await;
        for sub in subscribers.values_mut() {
            let payload = match compute_delta(&sub.last_delivered, snapshot) {
                Some(delta) => serde_json::to_string(&delta).ok(),
                None if sub.last_delivered.version == 0
                    || queue_changed(&sub.last_delivered.queue, &snapshot.queue) =>
                {
                    serde_json::to_string(snapshot).ok()
                }
                // Nothing a client could observe changed.
                None => None,
            };
            let Some(payload) = payload else {
                continue;
            };

            if sub.queue.try_send(payload).is_ok() {
                sub.last_delivered = snapshot.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use skaldi_core::types::{PlaybackStatus, QueueItem};

    fn snapshot(version: u64, current_time: f64, queue_names: &[&str]) -> Snapshot {
        Snapshot {
            version,
            status: PlaybackStatus::Playing,
            current_time,
            duration: 180.0,
            queue: queue_names
                .iter()
                .enumerate()
                .map(|(i, name)| QueueItem {
                    index: i,
                    filename: (*name).to_string(),
                    ..Default::default()
                })
                .collect(),
            current_index: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn never_sent_subscriber_gets_full_snapshot() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (_, mut rx) = broadcaster.subscribe(Snapshot::default()).await;

        broadcaster.fan_out(&snapshot(3, 10.0, &["a"])).await;

        let payload: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(payload["v"], 3);
        // full snapshots carry the queue, deltas never do
        assert!(payload.get("queue").is_some());
    }

    #[tokio::test]
    async fn same_queue_version_bump_yields_delta() {
        let broadcaster = Arc::new(Broadcaster::new());
        let prev = snapshot(7, 12.0, &["a"]);
        let (_, mut rx) = broadcaster.subscribe(prev).await;

        broadcaster.fan_out(&snapshot(8, 13.5, &["a"])).await;

        let payload: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(payload["v"], 8);
        assert_eq!(payload["current_time"], 13.5);
        assert!(payload.get("queue").is_none());
    }

    #[tokio::test]
    async fn time_tick_without_version_bump_yields_minimal_delta() {
        let broadcaster = Arc::new(Broadcaster::new());
        let prev = snapshot(7, 12.0, &["a"]);
        let (_, mut rx) = broadcaster.subscribe(prev).await;

        broadcaster.fan_out(&snapshot(7, 13.5, &["a"])).await;

        let payload: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(payload["v"], 7);
        assert_eq!(payload["current_time"], 13.5);
        assert!(payload.get("duration").is_none());
        assert!(payload.get("status").is_none());
    }

    #[tokio::test]
    async fn queue_change_forces_full_snapshot() {
        let broadcaster = Arc::new(Broadcaster::new());
        let prev = snapshot(7, 12.0, &["a"]);
        let (_, mut rx) = broadcaster.subscribe(prev).await;

        broadcaster.fan_out(&snapshot(8, 12.0, &["a", "b"])).await;

        let payload: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(payload["v"], 8);
        assert_eq!(payload["queue"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn identical_snapshot_sends_nothing() {
        let broadcaster = Arc::new(Broadcaster::new());
        let prev = snapshot(7, 12.0, &["a"]);
        let (_, mut rx) = broadcaster.subscribe(prev.clone()).await;

        broadcaster.fan_out(&prev).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_but_stays_consistent() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (_, mut rx) = broadcaster.subscribe(Snapshot::default()).await;

        // More updates than the queue holds; none of them consumed yet.
        for version in 1..=(SUBSCRIBER_BUFFER as u64 + 5) {
            broadcaster.fan_out(&snapshot(version, version as f64, &["a"])).await;
        }

        let mut received = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            received.push(serde_json::from_str::<Value>(&payload).unwrap());
        }
        assert_eq!(received.len(), SUBSCRIBER_BUFFER);

        // Versions are strictly increasing even across the gap.
        let versions: Vec<u64> = received.iter().map(|p| p["v"].as_u64().unwrap()).collect();
        for pair in versions.windows(2) {
            assert!(pair[0] < pair[1]);
        }

        // The dropped tail is caught up by the next update.
        broadcaster
            .fan_out(&snapshot(SUBSCRIBER_BUFFER as u64 + 6, 99.0, &["a"]))
            .await;
        let payload: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(payload["v"], SUBSCRIBER_BUFFER as u64 + 6);
        assert_eq!(payload["current_time"], 99.0);
    }

    #[tokio::test]
    async fn unsubscribe_closes_queue() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (id, mut rx) = broadcaster.subscribe(Snapshot::default()).await;

        broadcaster.unsubscribe(id).await;

        assert_eq!(broadcaster.subscriber_count().await, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn run_exits_when_update_channel_closes() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(Arc::clone(&broadcaster).run(rx));

        let (_, mut sub_rx) = broadcaster.subscribe(Snapshot::default()).await;
        tx.send(snapshot(1, 0.0, &["a"])).await.unwrap();
        assert!(sub_rx.recv().await.is_some());

        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("broadcaster should stop")
            .unwrap();
    }
}
