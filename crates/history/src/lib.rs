use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use skaldi_core::types::HistoryEntry;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{error, warn};

const HISTORY_BUFFER: usize = 100;

/// Write-behind sink for "track became current" records. Submissions never
/// block: a full buffer drops the new entry with a warning, accepted entries
/// are never displaced. The writer appends one JSON line per entry to
/// `history_YYYY-MM-DD.jsonl` (local date), rotating on date change.
#[derive(Clone)]
pub struct HistorySink {
    tx: mpsc::Sender<HistoryEntry>,
}

impl HistorySink {
    /// Spawn the writer task. Dropping every sink clone lets the writer
    /// drain its queue and exit; await the handle to complete shutdown.
    pub fn spawn(dir: PathBuf) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(HISTORY_BUFFER);
        let handle = tokio::spawn(write_loop(dir, rx));
        (Self { tx }, handle)
    }

    pub fn log(&self, entry: HistoryEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                warn!(title = %entry.title, "history buffer full, dropping entry");
            }
            // Writer already shut down; nothing left to record.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

async fn write_loop(dir: PathBuf, mut rx: mpsc::Receiver<HistoryEntry>) {
    let mut writer = RotatingWriter {
        dir,
        file: None,
        date: String::new(),
    };

    while let Some(entry) = rx.recv().await {
        if let Err(e) = writer.append(&entry) {
            error!(error = %e, "failed to write history entry");
        }
    }
}

struct RotatingWriter {
    dir: PathBuf,
    file: Option<File>,
    date: String,
}

impl RotatingWriter {
    fn append(&mut self, entry: &HistoryEntry) -> std::io::Result<()> {
        let date = entry
            .timestamp
            .with_timezone(&Local)
            .format("%Y-%m-%d")
            .to_string();

        if self.file.is_none() || self.date != date {
            std::fs::create_dir_all(&self.dir)?;
            let path = self.dir.join(format!("history_{date}.jsonl"));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.file = Some(file);
            self.date = date;
        }

        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let file = self.file.as_mut().expect("file opened above");
        writeln!(file, "{line}")
    }
}
