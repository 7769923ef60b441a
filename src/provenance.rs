//! Provenance log for the graph backend
//!
//! Append-only record of every mutation the graph backend performs.
//! - ProvenanceEvent: envelope with id + timestamp + kind
//! - ProvenanceKind: one variant per mutating capability, plus imports
//! - ProvenanceLog: thread-safe, append-only log
//!
//! Copies and links across owners double as *derived-from* edges between
//! tasks; see [`ProvenanceLog::edges`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single entry in the provenance log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    /// Monotonic sequence ID
    pub id: u64,
    /// Time since the backend was created (ms)
    pub timestamp_ms: u64,
    pub kind: ProvenanceKind,
}

/// What happened. `owner` / `path` always name the node that changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProvenanceKind {
    DirCreated {
        owner: Arc<str>,
        path: String,
    },
    TextWritten {
        owner: Arc<str>,
        path: String,
        bytes: usize,
    },
    Copied {
        source_owner: Arc<str>,
        source: String,
        owner: Arc<str>,
        path: String,
    },
    Linked {
        source_owner: Arc<str>,
        source: String,
        owner: Arc<str>,
        path: String,
        recursive: bool,
    },
    Deleted {
        owner: Arc<str>,
        path: String,
    },
    /// External file seeded into a read-only owner
    Imported {
        owner: Arc<str>,
        path: String,
        bytes: usize,
    },
}

impl ProvenanceKind {
    /// Owner of the node that changed
    pub fn owner(&self) -> &str {
        match self {
            Self::DirCreated { owner, .. }
            | Self::TextWritten { owner, .. }
            | Self::Copied { owner, .. }
            | Self::Linked { owner, .. }
            | Self::Deleted { owner, .. }
            | Self::Imported { owner, .. } => owner,
        }
    }

    /// `(upstream, downstream)` if this event moved data between owners
    pub fn derived_from(&self) -> Option<(&str, &str)> {
        match self {
            Self::Copied {
                source_owner, owner, ..
            }
            | Self::Linked {
                source_owner, owner, ..
            } if source_owner != owner => Some((&**source_owner, &**owner)),
            _ => None,
        }
    }
}

/// Thread-safe, append-only provenance log
#[derive(Clone)]
pub struct ProvenanceLog {
    events: Arc<RwLock<Vec<ProvenanceEvent>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl ProvenanceLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append an event, returns its ID
    pub fn record(&self, kind: ProvenanceKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = ProvenanceEvent {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };

        self.events.write().push(event);
        id
    }

    /// All events (cloned)
    pub fn events(&self) -> Vec<ProvenanceEvent> {
        self.events.read().clone()
    }

    /// Events that changed nodes of one owner
    pub fn filter_owner(&self, owner: &str) -> Vec<ProvenanceEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind.owner() == owner)
            .cloned()
            .collect()
    }

    /// Distinct `(upstream, downstream)` owner pairs
    pub fn edges(&self) -> BTreeSet<(String, String)> {
        self.events
            .read()
            .iter()
            .filter_map(|e| e.kind.derived_from())
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProvenanceLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProvenanceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvenanceLog")
            .field("len", &self.len())
            .finish()
    }
}
