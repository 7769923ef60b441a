//! Uid ledger: one append-only record per task call

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;

use crate::error::StageError;

/// Allowed task names: no separators, never starting with punctuation
static TASK_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.+\-]*$").unwrap());

/// `NN-name` as produced by [`UidLedger::assign`]; NN has at least two digits
static TASK_UID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]{2,})-[A-Za-z0-9][A-Za-z0-9_.+\-]*$").unwrap());

/// Ordinal of a working directory name, `None` if it is not a task uid
pub fn uid_ordinal(uid: &str) -> Option<usize> {
    TASK_UID.captures(uid)?.get(1)?.as_str().parse().ok()
}

/// One task call. `uid` is `NN-name`, NN the 1-based ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub ordinal: usize,
    pub name: String,
    pub uid: String,
    /// Non-fatal problems hit while the task ran
    pub warnings: Vec<String>,
}

/// Ordered task records owned by one engine
#[derive(Debug, Default)]
pub struct UidLedger {
    records: RwLock<Vec<TaskRecord>>,
}

impl UidLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `name` and append a record with the next ordinal.
    ///
    /// An invalid name consumes nothing.
    pub fn assign(&self, name: &str) -> Result<String, StageError> {
        if !TASK_NAME.is_match(name) {
            return Err(StageError::InvalidTaskName {
                name: name.to_string(),
            });
        }
        let mut records = self.records.write();
        let ordinal = records.len() + 1;
        let uid = format!("{ordinal:02}-{name}");
        records.push(TaskRecord {
            ordinal,
            name: name.to_string(),
            uid: uid.clone(),
            warnings: Vec::new(),
        });
        Ok(uid)
    }

    pub fn warn(&self, uid: &str, warning: impl Into<String>) {
        if let Some(record) = self.records.write().iter_mut().find(|r| r.uid == uid) {
            record.warnings.push(warning.into());
        }
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
