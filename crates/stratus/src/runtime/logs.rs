//! Per-repository log capture: a durable append-only file plus a live
//! broadcast fan-out for WebSocket subscribers.
//!
//! The durable file always holds the full history until it is explicitly
//! deleted. The broadcast side only carries entries produced after a
//! subscriber attaches; a slow subscriber lags and drops its oldest entries
//! instead of ever blocking the producer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};

/// Size of the per-subscriber broadcast buffer.
const SUBSCRIBER_BUFFER_SIZE: usize = 256;

/// Which stream a log entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Entries produced by the platform itself (stage transitions, crashes).
    System,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
            LogStream::System => write!(f, "system"),
        }
    }
}

/// One captured line of process output.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

/// Append-only log sink for a single repository.
pub struct LogSink {
    repository_id: String,
    path: PathBuf,
    /// Write handle, opened lazily and dropped on `close`/`clear`.
    file: Mutex<Option<File>>,
    tx: broadcast::Sender<LogEntry>,
}

impl LogSink {
    /// Create a sink backed by `<dir>/<repository_id>.log`.
    pub async fn open(repository_id: &str, dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating log directory: {}", dir.display()))?;
        let path = dir.join(format!("{}.log", repository_id));
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER_SIZE);

        Ok(Self {
            repository_id: repository_id.to_string(),
            path,
            file: Mutex::new(None),
            tx,
        })
    }

    /// Append an entry: durable write first, then broadcast.
    ///
    /// The durable write happens whether or not anyone is subscribed, and a
    /// full subscriber queue never blocks this call.
    pub async fn append(&self, stream: LogStream, line: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            stream,
            line: line.into(),
        };

        let formatted = format!(
            "{} [{}] {}\n",
            entry.timestamp.to_rfc3339(),
            entry.stream,
            entry.line
        );

        {
            let mut guard = self.file.lock().await;
            if guard.is_none() {
                match OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await
                {
                    Ok(file) => *guard = Some(file),
                    Err(e) => warn!(
                        "Failed to open log file for repository {}: {}",
                        self.repository_id, e
                    ),
                }
            }
            if let Some(file) = guard.as_mut() {
                if let Err(e) = file.write_all(formatted.as_bytes()).await {
                    warn!(
                        "Failed to append to log file for repository {}: {}",
                        self.repository_id, e
                    );
                }
            }
        }

        // No subscribers is fine; send only fails when none are attached.
        let _ = self.tx.send(entry);
    }

    /// Subscribe to entries produced after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    /// Read the full durable history. Missing file reads as empty.
    pub async fn history(&self) -> Result<String> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => {
                Err(e).with_context(|| format!("reading log file: {}", self.path.display()))
            }
        }
    }

    /// Flush and drop the write handle. The next `append` reopens it.
    pub async fn close(&self) {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            if let Err(e) = file.flush().await {
                debug!(
                    "Failed to flush log file for repository {}: {}",
                    self.repository_id, e
                );
            }
        }
    }

    /// Delete the durable log file. Only called by teardown-with-deletion;
    /// a plain restart keeps the history.
    pub async fn clear(&self) -> Result<()> {
        self.close().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("deleting log file: {}", self.path.display()))
            }
        }
    }

    /// Path of the durable log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Process-wide map of repository id to its log sink.
///
/// Sinks outlive individual process sessions so that a restart keeps
/// appending to the same history.
pub struct LogStore {
    dir: PathBuf,
    sinks: DashMap<String, Arc<LogSink>>,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sinks: DashMap::new(),
        }
    }

    /// Get the sink for a repository, creating it on first use.
    pub async fn sink_for(&self, repository_id: &str) -> Result<Arc<LogSink>> {
        if let Some(sink) = self.sinks.get(repository_id) {
            return Ok(sink.clone());
        }
        let sink = Arc::new(LogSink::open(repository_id, &self.dir).await?);
        let entry = self
            .sinks
            .entry(repository_id.to_string())
            .or_insert(sink);
        Ok(entry.clone())
    }

    /// Get the sink for a repository if one exists.
    pub fn get(&self, repository_id: &str) -> Option<Arc<LogSink>> {
        self.sinks.get(repository_id).map(|s| s.clone())
    }

    /// Delete a repository's durable log and forget its sink.
    pub async fn remove(&self, repository_id: &str) -> Result<()> {
        if let Some((_, sink)) = self.sinks.remove(repository_id) {
            sink.clear().await?;
        } else {
            // No live sink; the file may still exist from a previous run.
            let path = self.dir.join(format!("{}.log", repository_id));
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("deleting log file: {}", path.display()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_is_durable_without_subscribers() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::open("repo-1", dir.path()).await.unwrap();

        sink.append(LogStream::Stdout, "hello").await;
        sink.append(LogStream::Stderr, "world").await;
        sink.close().await;

        let history = sink.history().await.unwrap();
        assert!(history.contains("[stdout] hello"));
        assert!(history.contains("[stderr] world"));
    }

    #[tokio::test]
    async fn test_subscriber_only_sees_entries_after_attach() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::open("repo-1", dir.path()).await.unwrap();

        sink.append(LogStream::Stdout, "before").await;

        let mut rx = sink.subscribe();
        sink.append(LogStream::Stdout, "after").await;

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.line, "after");
        assert!(rx.try_recv().is_err());

        // The durable file still holds everything.
        let history = sink.history().await.unwrap();
        assert!(history.contains("before"));
        assert!(history.contains("after"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_without_blocking() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::open("repo-1", dir.path()).await.unwrap();

        let mut rx = sink.subscribe();
        for i in 0..(SUBSCRIBER_BUFFER_SIZE + 10) {
            sink.append(LogStream::Stdout, format!("line {}", i)).await;
        }

        // The receiver lagged; the first recv reports how many were dropped.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clear_deletes_file_and_history_reads_empty() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::open("repo-1", dir.path()).await.unwrap();

        sink.append(LogStream::System, "starting").await;
        sink.clear().await.unwrap();

        assert!(!sink.path().exists());
        assert_eq!(sink.history().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_store_reuses_sink_across_restarts() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());

        let a = store.sink_for("repo-1").await.unwrap();
        let b = store.sink_for("repo-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.append(LogStream::Stdout, "kept across restart").await;
        a.close().await;
        // A later session appends to the same file.
        b.append(LogStream::Stdout, "second session").await;
        b.close().await;

        let history = b.history().await.unwrap();
        assert!(history.contains("kept across restart"));
        assert!(history.contains("second session"));
    }

    #[tokio::test]
    async fn test_store_remove_deletes_durable_log() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());

        let sink = store.sink_for("repo-1").await.unwrap();
        sink.append(LogStream::Stdout, "doomed").await;
        let path = sink.path().to_path_buf();

        store.remove("repo-1").await.unwrap();
        assert!(!path.exists());
        assert!(store.get("repo-1").is_none());
    }
}
