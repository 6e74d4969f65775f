use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Entries retained before the oldest are dropped.
const LOG_CAPACITY: usize = 1000;

/// One transmitted command with its timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub command: String,
}

/// Bounded history of every command handed to the transport.
///
/// `append` is strictly best-effort: it stamps the entry and takes a
/// non-blocking write, so the send path can never stall on the log. The
/// total counter keeps counting past the retention bound.
#[derive(Clone, Debug)]
pub struct CommandLog {
    entries: Arc<RwLock<VecDeque<LogEntry>>>,
    total: Arc<AtomicUsize>,
    capacity: usize,
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandLog {
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            total: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Records a transmitted command, stamped with the current local time.
    pub fn append(&self, command: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Local::now(),
            command: command.into(),
        };
        match self.entries.try_write() {
            Ok(mut guard) => {
                if guard.len() == self.capacity {
                    guard.pop_front();
                }
                guard.push_back(entry);
                self.total.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Command log busy, dropping entry: {}", e),
        }
    }

    /// Total number of commands appended, including trimmed ones.
    pub fn count(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Up to `limit` most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        match self.entries.try_read() {
            Ok(guard) => guard.iter().rev().take(limit).cloned().collect(),
            Err(e) => {
                warn!("Unable to read command log: {}", e);
                Vec::new()
            }
        }
    }
}
