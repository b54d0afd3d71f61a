//! Persistent per-session output history.
//!
//! Pairs an in-memory ring buffer (fast replay, bounded) with an append-only
//! on-disk log (scrollback that survives server restarts). Writes hit the
//! ring synchronously so replay is always consistent with what was emitted;
//! the disk append goes through a single writer task and is best-effort —
//! a failing disk degrades scrollback depth, never the live session.
//!
//! Log line format: `timestamp_ms|base64(chunk)`.

use super::ring_buffer::RingBuffer;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::{Path, PathBuf};
use termdeck_core::record::now_ms;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Default replay window, in entries.
pub const DEFAULT_HISTORY_CAPACITY: usize = 5000;

enum LogCommand {
    Append(String),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Per-session history: ring buffer plus append-only log file.
pub struct HistoryStore {
    buffer: RingBuffer<Vec<u8>>,
    log_tx: mpsc::UnboundedSender<LogCommand>,
}

impl HistoryStore {
    /// Open the history for a session, restoring the most recent entries
    /// from the on-disk log if one exists. Malformed lines are skipped
    /// individually; a missing file is a fresh session, not an error.
    pub async fn open(path: PathBuf, capacity: usize) -> Self {
        let mut buffer = RingBuffer::new(capacity);

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let lines: Vec<&str> = content.lines().collect();
                let start = lines.len().saturating_sub(capacity);
                let mut skipped = 0usize;
                for line in &lines[start..] {
                    match parse_line(line) {
                        Some(chunk) => buffer.push(chunk),
                        None => skipped += 1,
                    }
                }
                if skipped > 0 {
                    debug!(path = %path.display(), skipped, "skipped malformed history lines");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not restore history log");
            }
        }

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        tokio::spawn(log_writer(path, log_rx));

        Self { buffer, log_tx }
    }

    /// Record an output chunk: ring buffer synchronously, disk append
    /// fire-and-forget.
    pub fn write(&mut self, chunk: &[u8]) {
        self.buffer.push(chunk.to_vec());
        let line = format!("{}|{}\n", now_ms(), BASE64.encode(chunk));
        // Receiver only drops if the writer task died; history then degrades
        // to memory-only.
        let _ = self.log_tx.send(LogCommand::Append(line));
    }

    /// Buffered chunks, oldest to newest.
    pub fn recent_chunks(&self) -> Vec<Vec<u8>> {
        self.buffer.to_vec()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop the in-memory buffer and best-effort delete the log file.
    pub fn clear(&mut self) {
        self.buffer.clear();
        let _ = self.log_tx.send(LogCommand::Clear);
    }

    /// Wait until every append issued so far has been written to disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.log_tx.send(LogCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Single writer task per history store: preserves append order and keeps
/// disk latency off the output path.
async fn log_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<LogCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LogCommand::Append(line) => {
                if let Err(e) = append_line(&path, &line).await {
                    error!(path = %path.display(), error = %e, "history append failed");
                }
            }
            LogCommand::Clear => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        debug!(path = %path.display(), error = %e, "history log delete failed");
                    }
                }
            }
            LogCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// A well-formed line is `timestamp_ms|base64(chunk)`; only the chunk is
/// kept in memory, the timestamp just has to parse.
fn parse_line(line: &str) -> Option<Vec<u8>> {
    let (ts, payload) = line.split_once('|')?;
    ts.parse::<u64>().ok()?;
    BASE64.decode(payload.trim_end()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.log");

        let mut history = HistoryStore::open(path.clone(), 100).await;
        for i in 0..5 {
            history.write(format!("chunk-{i}").as_bytes());
        }
        history.flush().await;
        drop(history);

        // Simulated restart: a fresh store sees the same chunks in order.
        let restored = HistoryStore::open(path, 100).await;
        let chunks = restored.recent_chunks();
        assert_eq!(chunks.len(), 5);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk, format!("chunk-{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn restore_keeps_only_last_capacity_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.log");

        let mut history = HistoryStore::open(path.clone(), 200).await;
        for i in 0..20 {
            history.write(format!("{i}").as_bytes());
        }
        history.flush().await;
        drop(history);

        let restored = HistoryStore::open(path, 8).await;
        let chunks = restored.recent_chunks();
        assert_eq!(chunks.len(), 8);
        assert_eq!(chunks[0], b"12");
        assert_eq!(chunks[7], b"19");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_individually() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.log");
        let good = format!("1000|{}\n", BASE64.encode(b"ok"));
        let contents = format!("not-a-timestamp|aGk=\n{good}12345|%%%not-base64%%%\n");
        tokio::fs::write(&path, contents).await.unwrap();

        let restored = HistoryStore::open(path, 100).await;
        assert_eq!(restored.recent_chunks(), vec![b"ok".to_vec()]);
    }

    #[tokio::test]
    async fn clear_empties_memory_and_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.log");

        let mut history = HistoryStore::open(path.clone(), 100).await;
        history.write(b"data");
        history.flush().await;
        assert!(path.exists());

        history.clear();
        history.flush().await;
        assert!(history.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_file_is_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let history = HistoryStore::open(dir.path().join("absent.log"), 10).await;
        assert!(history.is_empty());
    }
}
