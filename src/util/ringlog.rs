//! Bounded in-memory log rings.
//!
//! Workers and clusters each keep a ring of recent log entries that the
//! debug HTTP interface exposes read-only. The ring drops the oldest entry
//! once full.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::util::NamespacedName;

/// One line of reconcile progress.
#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<NamespacedName>,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: &str, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            level: level.to_string(),
            worker: None,
            cluster: None,
            message: message.into(),
        }
    }

    pub fn with_worker(mut self, worker: u32) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_cluster(mut self, cluster: NamespacedName) -> Self {
        self.cluster = Some(cluster);
        self
    }
}

/// Fixed-capacity ring of [`LogEntry`] values.
#[derive(Debug)]
pub struct RingLog {
    size: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl RingLog {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            entries: Mutex::new(VecDeque::with_capacity(size.max(1))),
        }
    }

    /// Append an entry, evicting the oldest when the ring is full.
    pub fn insert(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().expect("ring log poisoned");
        if entries.len() == self.size {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot of the ring contents, oldest first.
    pub fn walk(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .expect("ring log poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
