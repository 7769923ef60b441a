//! Stagehand - execution-staging engine for external-program pipelines
//!
//! Tasks get numbered working directories (`01-scf`, `02-nscf`, ...), their
//! file arguments staged by copy or link, and their inputs and outputs
//! persisted. The same pipeline runs on a local filesystem or on an
//! in-memory provenance graph.

pub mod backend;
pub mod calc;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod file_ref;
pub mod pipeline;
pub mod provenance;
pub mod pw;
pub mod task_arg;

pub use backend::{stage, stage_copy, stage_link, Backend, GraphBackend, LocalBackend};
pub use calc::{CalcReport, CalcStatus, Calculator, MockCalculator, ProgramCalculator};
pub use commands::CommandTable;
pub use config::Config;
pub use engine::{Engine, Requirement, Schema, TaskContext, TaskDef, TaskRecord};
pub use error::{FixSuggestion, StageError};
pub use file_ref::{FileRef, LinkMode, LinkSpec};
pub use pipeline::{run_scf_nscf_bands, PipelineInputs, PipelineOutcome};
pub use provenance::{ProvenanceEvent, ProvenanceKind, ProvenanceLog};
pub use task_arg::{Outputs, TaskArg, TaskArgs};
