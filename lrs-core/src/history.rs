//! History - Targets Read and Written Through a Backend
//!
//! `TigerStyle`: Append-only, shared via Arc.
//!
//! Backends that enumerate files or objects use it to answer
//! `list(new = true)`: targets already read are skipped.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    /// Records were read from the target
    Read,
    /// Records were written to the target
    Write,
}

/// One history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Engine name
    pub backend: String,
    /// Read or write
    pub action: HistoryAction,
    /// Target identifier (file, object key, table...)
    pub target: String,
    /// When the action completed
    pub timestamp: DateTime<Utc>,
}

/// Shared, append-only history.
#[derive(Debug, Clone, Default)]
pub struct History {
    entries: Arc<RwLock<Vec<HistoryEntry>>>,
}

impl History {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn record(&self, backend: &str, action: HistoryAction, target: &str) {
        assert!(!target.is_empty(), "history target must not be empty");
        self.entries.write().unwrap().push(HistoryEntry {
            backend: backend.to_string(),
            action,
            target: target.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// True if `target` was already read through `backend`.
    #[must_use]
    pub fn was_read(&self, backend: &str, target: &str) -> bool {
        self.entries
            .read()
            .unwrap()
            .iter()
            .any(|e| e.action == HistoryAction::Read && e.backend == backend && e.target == target)
    }

    /// Snapshot of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.read().unwrap().clone()
    }
}
