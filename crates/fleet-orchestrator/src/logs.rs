//! Status/Log Fan-in
//!
//! Merges output lines from all supervised processes into one consumable
//! feed, each line tagged with its originating instance's prefix. Multiple
//! consumers subscribe independently; a slow consumer lags and loses the
//! oldest lines instead of stalling producers. Lines from the same instance
//! keep their emission order.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Local};
use tokio::sync::broadcast;

/// Lines kept for replay to late subscribers.
const MAX_HISTORY: usize = 2000;

/// Broadcast channel depth; laggards skip past what they missed.
const CHANNEL_CAPACITY: usize = 1024;

/// Prefix used for orchestrator-level status lines.
pub const FLEET_PREFIX: &str = "[fleet]";

/// One tagged line of output or status.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub prefix: String,
    pub line: String,
}

impl LogLine {
    pub fn format(&self) -> String {
        format!(
            "[{}] {} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.prefix,
            self.line
        )
    }
}

/// Thread-safe log collector with broadcast fan-out and bounded history.
pub struct LogHub {
    tx: broadcast::Sender<LogLine>,
    history: Mutex<VecDeque<LogLine>>,
}

impl LogHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
        }
    }

    /// Emit a line from any thread. Never blocks; a send with no subscribers
    /// only records history.
    pub fn emit(&self, prefix: &str, line: impl Into<String>) {
        let entry = LogLine {
            timestamp: Local::now(),
            prefix: prefix.to_string(),
            line: line.into(),
        };

        {
            let mut history = self.history.lock().unwrap();
            if history.len() == MAX_HISTORY {
                history.pop_front();
            }
            history.push_back(entry.clone());
        }

        let _ = self.tx.send(entry);
    }

    /// Orchestrator-level status line.
    pub fn emit_status(&self, line: impl Into<String>) {
        self.emit(FLEET_PREFIX, line);
    }

    /// Attach a new independent consumer.
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }

    /// Most recent lines, optionally filtered by prefix.
    pub fn recent(&self, limit: usize, prefix: Option<&str>) -> Vec<LogLine> {
        let history = self.history.lock().unwrap();
        history
            .iter()
            .filter(|entry| prefix.map_or(true, |p| entry.prefix == p))
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}
