//! # Calculators
//!
//! The opaque collaborator that actually runs a calculation inside a task's
//! working directory. A calculation that fails is reported, not raised:
//! [`CalcReport`] with [`CalcStatus::Failed`] is an ordinary result.
//!
//! - [`ProgramCalculator`] - spawns the configured program on the host
//! - [`MockCalculator`] - deterministic stand-in that works on any backend

mod mock;
mod program;

pub use mock::{MockCalculator, CHARGE_DENSITY, DATA_FILE};
pub use program::ProgramCalculator;

use serde::{Deserialize, Serialize};

/// Outcome of one calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalcStatus {
    Completed,
    Failed,
}

/// Why a calculation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalcErrorKind {
    /// Program exited with a non-zero status
    ProcessFailed,
    /// Program could not be started
    SpawnFailed,
    Timeout,
    /// No command configured for the program key
    MissingCommand,
}

/// Everything a calculator needs to run one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalcRequest {
    /// Working directory owner
    pub uid: String,
    /// Program key, e.g. `pw`
    pub program: String,
    /// Command line from the command table, if one is configured
    pub command: Option<String>,
    /// Calculation type, e.g. `scf`
    pub calculation: String,
    /// Input file name, already written to the working directory
    pub input_file: String,
    /// Content of the input file
    pub input: String,
    /// Output directory name inside the working directory
    pub outdir: String,
    /// File prefix for restart data
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalcReport {
    pub status: CalcStatus,
    pub error_message: Option<String>,
    pub error_kind: Option<CalcErrorKind>,
    pub walltime_s: f64,
}

impl CalcReport {
    pub fn completed(walltime_s: f64) -> Self {
        Self {
            status: CalcStatus::Completed,
            error_message: None,
            error_kind: None,
            walltime_s,
        }
    }

    pub fn failed(kind: CalcErrorKind, message: impl Into<String>, walltime_s: f64) -> Self {
        Self {
            status: CalcStatus::Failed,
            error_message: Some(message.into()),
            error_kind: Some(kind),
            walltime_s,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == CalcStatus::Completed
    }
}

/// Runs a calculation described by a [`CalcRequest`].
///
/// `Err` is reserved for problems with the environment (e.g. the backend
/// refusing a write); a failed calculation is `Ok` with a failed report.
pub trait Calculator: Send + Sync {
    fn calculate(&self, request: &CalcRequest) -> anyhow::Result<CalcReport>;
}
