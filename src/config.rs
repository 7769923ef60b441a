//! Run configuration (YAML)
//!
//! ```yaml
//! backend: local            # local | graph
//! root: runs/si
//! outdir: tmp
//! calculator: program       # program | mock
//! timeout_secs: 3600
//! commands:
//!   pw: mpirun -n 8 pw.x
//! pseudo_library: /opt/pseudopotentials
//! pipeline:
//!   species: [Si]
//!   pseudopotential_family: SSSP_1.3_PBE_efficiency
//!   parameters:
//!     system: {ecutwfc: 30, ibrav: 2, nat: 2, ntyp: 1}
//!   kpoints: {grid: [4, 4, 4], path: GXWLG}
//! ```
//!
//! Precedence for `root`: CLI flag, then `STAGEHAND_ROOT`, then the file.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::commands::CommandTable;
use crate::error::StageError;
use crate::file_ref::relative_path;
use crate::pipeline::PipelineInputs;
use crate::pw::{self, PwStep};

/// Environment variable that overrides `root`
pub const ROOT_ENV: &str = "STAGEHAND_ROOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CalculatorKind {
    #[default]
    Program,
    Mock,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_outdir")]
    pub outdir: String,
    #[serde(default)]
    pub commands: CommandTable,
    #[serde(default)]
    pub calculator: CalculatorKind,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub pseudo_library: Option<PathBuf>,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub species: Vec<String>,
    #[serde(default = "default_family")]
    pub pseudopotential_family: String,
    #[serde(default = "empty_mapping")]
    pub parameters: Value,
    #[serde(default)]
    pub kpoints: Value,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_outdir() -> String {
    "tmp".to_string()
}

fn default_timeout() -> u64 {
    3600
}

fn default_family() -> String {
    "SSSP_1.3_PBE_efficiency".to_string()
}

fn empty_mapping() -> Value {
    Value::Object(Map::new())
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, StageError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read a config file and apply `STAGEHAND_ROOT`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StageError> {
        let yaml = fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&yaml)?;
        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.is_empty() {
                config.root = PathBuf::from(root);
            }
        }
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check everything a run needs, without touching the filesystem
    pub fn validate(&self) -> Result<(), StageError> {
        let outdir = relative_path(Path::new(&self.outdir))?;
        if outdir.as_os_str().is_empty() {
            return Err(StageError::Config("outdir must not be empty".into()));
        }
        if self.pipeline.species.is_empty() {
            return Err(StageError::Config("pipeline.species is empty".into()));
        }
        if self.calculator == CalculatorKind::Program {
            if self.backend == BackendKind::Graph {
                return Err(StageError::Config(
                    "the program calculator needs the local backend; use calculator: mock".into(),
                ));
            }
            if self.commands.get(pw::PROGRAM).is_none() {
                return Err(StageError::Config(format!(
                    "commands.{} is required by the program calculator",
                    pw::PROGRAM
                )));
            }
            if self.timeout_secs == 0 {
                return Err(StageError::Config("timeout_secs must be positive".into()));
            }
        }
        for step in [PwStep::Scf, PwStep::Nscf, PwStep::Bands] {
            let params = pw::normalize(step, &self.pipeline.parameters, &self.outdir)?;
            pw::check_requirements(step, &params)
                .map_err(|e| StageError::Config(format!("{step}: {e}")))?;
        }
        Ok(())
    }

    /// Inputs for [`run_scf_nscf_bands`](crate::pipeline::run_scf_nscf_bands)
    pub fn pipeline_inputs(&self) -> Result<PipelineInputs, StageError> {
        let pseudo_library = match &self.pseudo_library {
            Some(dir) => Some(lexical_absolute(dir)?),
            None => None,
        };
        Ok(PipelineInputs {
            species: self.pipeline.species.clone(),
            pseudopotential_family: self.pipeline.pseudopotential_family.clone(),
            parameters: self.pipeline.parameters.clone(),
            kpoints: self.pipeline.kpoints.clone(),
            pseudo_library,
            outdir: self.outdir.clone(),
        })
    }
}

/// Absolute form of `path` with `.` and `..` folded away, without touching
/// the filesystem
fn lexical_absolute(path: &Path) -> Result<PathBuf, StageError> {
    let mut out = PathBuf::new();
    for component in std::path::absolute(path)?.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    Ok(out)
}
