use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::PlayerError;

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered unsolicited events; lagging consumers lose the oldest first.
pub const EVENT_BUFFER: usize = 100;

/// Unsolicited message pushed by the player.
#[derive(Debug, Clone)]
pub struct PlayerEvent {
    pub event: String,
    pub name: String,
    pub data: Value,
}

#[derive(Debug)]
struct Reply {
    error: String,
    data: Value,
}

#[derive(Serialize)]
struct Request<'a> {
    command: &'a Value,
    request_id: u64,
}

/// One line off the socket: a reply (keyed by `request_id`) or, when the
/// `event` field is present, an asynchronous notification.
#[derive(Deserialize)]
struct Incoming {
    #[serde(default)]
    request_id: u64,
    #[serde(default)]
    error: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    event: String,
    #[serde(default)]
    name: String,
}

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Line-delimited JSON client for the player's IPC socket. Requests and
/// replies are matched by `request_id`; everything else is fanned out on a
/// broadcast channel. One instance survives player restarts: `connect` is
/// called again on the same client and the event channel carries on.
pub struct IpcClient {
    socket_path: PathBuf,
    next_request_id: AtomicU64,
    pending: PendingTable,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<PlayerEvent>,
}

impl IpcClient {
    pub fn new(socket_path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            socket_path,
            next_request_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Dial the socket, retrying while the player is still creating it.
    pub async fn connect(&self) -> Result<(), PlayerError> {
        let mut stream = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match UnixStream::connect(&self.socket_path).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => tokio::time::sleep(CONNECT_RETRY_DELAY).await,
            }
        }
        let Some(stream) = stream else {
            return Err(PlayerError::Unreachable(self.socket_path.clone()));
        };

        let (read_half, write_half) = stream.into_split();
        self.pending.lock().await.clear();
        *self.writer.lock().await = Some(write_half);

        let handle = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&self.pending),
            self.events.clone(),
        ));
        if let Some(old) = self.reader.lock().await.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Issue one command (a JSON array of verb + arguments) and wait for the
    /// matching reply. Concurrent calls are fine; replies are matched by id.
    pub async fn exec(&self, command: Value) -> Result<Value, PlayerError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, reply_tx);

        let mut line = serde_json::to_vec(&Request {
            command: &command,
            request_id,
        })?;
        line.push(b'\n');

        let write_result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => w.write_all(&line).await.map_err(PlayerError::Io),
                None => Err(PlayerError::Closed),
            }
        };
        if let Err(e) = write_result {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(REPLY_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => {
                if !reply.error.is_empty() && reply.error != "success" {
                    return Err(PlayerError::Remote(reply.error));
                }
                Ok(reply.data)
            }
            // Sender dropped: the connection went away underneath us.
            Ok(Err(_)) => Err(PlayerError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(PlayerError::Timeout)
            }
        }
    }

    /// Idempotent: shuts the socket, stops the reader, fails pending calls.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.pending.lock().await.clear();
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    pending: PendingTable,
    events: broadcast::Sender<PlayerEvent>,
) {
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let msg: Incoming = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(_) => continue,
        };

        if !msg.event.is_empty() {
            // No receivers is fine; the router may not be up yet.
            let _ = events.send(PlayerEvent {
                event: msg.event,
                name: msg.name,
                data: msg.data,
            });
        } else if let Some(reply_tx) = pending.lock().await.remove(&msg.request_id) {
            let _ = reply_tx.send(Reply {
                error: msg.error,
                data: msg.data,
            });
        }
    }

    // Connection gone: fail anything still waiting.
    pending.lock().await.clear();
    debug!("ipc read loop exited");
}
