//! Bounded in-memory event log shown to operators.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::models::contains_ignore_case;

/// Maximum number of log lines kept in memory
pub const MAX_LOG_LINES: usize = 500;

/// Capacity of the live-line broadcast channel; slow subscribers lag, they never block appends
const SUBSCRIBER_BACKLOG: usize = 64;

/// Append-only ring of timestamped, human-readable lines.
///
/// Cloning is cheap and all clones share the same buffer, so the listener and
/// every connection task can append while an observer reads or clears.
#[derive(Clone)]
pub struct LogSink {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    live: broadcast::Sender<String>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::with_capacity(MAX_LOG_LINES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
            live,
        }
    }

    /// Record a line stamped with the local wall-clock time.
    pub fn push(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!("{}", message);

        let line = format!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), message);
        self.push_line(line);
    }

    fn push_line(&self, line: String) {
        {
            let mut lines = self.lines.lock();
            lines.push_back(line.clone());
            // Exactly one eviction per overflowing append
            if lines.len() > self.capacity {
                lines.pop_front();
            }
        }
        // No subscribers is fine
        let _ = self.live.send(line);
    }

    /// Snapshot of all lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Lines containing `query`, ignoring ASCII case. An empty query matches everything.
    pub fn filtered(&self, query: &str) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| contains_ignore_case(line, query))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Receive every line appended after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.live.subscribe()
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}
