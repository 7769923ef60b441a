//! Error types with fix suggestions
//!
//! Engine-level failures only. A calculation that reports a failed status is
//! not an error here: it comes back as a normal output mapping.

use std::io;

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug)]
pub enum StageError {
    // ─────────────────────────────────────────────────────────────
    // Naming and references (STG-010 to STG-012)
    // ─────────────────────────────────────────────────────────────
    #[error("STG-010: Invalid task name '{name}'")]
    InvalidTaskName { name: String },

    #[error("STG-011: Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    // ─────────────────────────────────────────────────────────────
    // Backend and staging (STG-020 to STG-022)
    // ─────────────────────────────────────────────────────────────
    #[error("STG-020: {op} failed on {target}: {source}")]
    Backend {
        op: &'static str,
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("STG-021: Staging source {from} does not exist")]
    SourceMissing { from: String },

    #[error("STG-022: Destination {target} already exists and overwrite is disabled")]
    DestinationExists { target: String },

    // ─────────────────────────────────────────────────────────────
    // Schema validation (STG-030 to STG-032)
    // ─────────────────────────────────────────────────────────────
    #[error("STG-030: Input validation failed for task '{uid}': {details}")]
    InputValidation { uid: String, details: String },

    #[error("STG-031: Output validation failed for task '{uid}': {details}")]
    OutputValidation { uid: String, details: String },

    #[error("STG-032: Invalid schema: {details}")]
    InvalidSchema { details: String },

    // ─────────────────────────────────────────────────────────────
    // Task function failures (STG-040)
    // ─────────────────────────────────────────────────────────────
    #[error("STG-040: Task '{uid}' failed: {source}")]
    Task {
        uid: String,
        #[source]
        source: anyhow::Error,
    },

    // ─────────────────────────────────────────────────────────────
    // Serialization and configuration (STG-050 to STG-053)
    // ─────────────────────────────────────────────────────────────
    #[error("STG-050: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("STG-051: YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("STG-052: Configuration error: {0}")]
    Config(String),

    #[error("STG-053: IO error: {0}")]
    Io(#[from] io::Error),
}

impl StageError {
    /// Wrap an `io::Error` raised by a backend capability
    pub fn backend(op: &'static str, target: impl ToString, source: io::Error) -> Self {
        Self::Backend {
            op,
            target: target.to_string(),
            source,
        }
    }

    /// The `io::ErrorKind` of a backend failure, if this is one
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Backend { source, .. } | Self::Io(source) => Some(source.kind()),
            _ => None,
        }
    }

    /// The error returned by the task function, unchanged
    pub fn task_source(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Task { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl FixSuggestion for StageError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            StageError::InvalidTaskName { .. } => {
                Some("Use letters, digits, '.', '_', '+' or '-' and start with a letter or digit")
            }
            StageError::InvalidPath { .. } => {
                Some("Use a path relative to the owning task, without '..' components")
            }
            StageError::Backend { .. } => Some("Check the working directory root and permissions"),
            StageError::SourceMissing { .. } => {
                Some("Make sure the upstream task completed and declared this output")
            }
            StageError::DestinationExists { .. } => {
                Some("Set overwrite: true on the link or pick another destination name")
            }
            StageError::InputValidation { .. } => Some("Fix the task arguments to match its input schema"),
            StageError::OutputValidation { .. } => {
                Some("Fix the task function so its outputs match the declared schema")
            }
            StageError::InvalidSchema { .. } => Some("Check the schema is valid JSON Schema"),
            StageError::Task { .. } => {
                Some("Inspect the task working directory; it is left in place on failure")
            }
            StageError::Json(_) => None,
            StageError::YamlParse(_) => Some("Check YAML syntax: indentation and quoting"),
            StageError::Config(_) => Some("Run `stagehand validate <config>` for details"),
            StageError::Io(_) => Some("Check file path and permissions"),
        }
    }
}
