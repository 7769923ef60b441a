//! scf -> nscf -> bands
//!
//! Each restart step links the previous step's output directory into its
//! own working directory, file by file, then runs pw on top of it. The
//! pipeline stops at the first step whose calculation reports failure.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::calc::{CalcReport, CalcStatus, Calculator};
use crate::engine::Engine;
use crate::error::StageError;
use crate::file_ref::{FileRef, LinkSpec};
use crate::pw::{self, PwStep};
use crate::task_arg::{TaskArg, TaskArgs};

/// What the pipeline needs besides the engine and calculator
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    pub species: Vec<String>,
    pub pseudopotential_family: String,
    /// Raw pw parameters, normalised per step
    pub parameters: Value,
    /// Opaque; `grid` feeds scf/nscf and `path` feeds bands when present
    pub kpoints: Value,
    /// Directory holding `<family>/<Symbol>.upf`
    pub pseudo_library: Option<PathBuf>,
    pub outdir: String,
}

/// One finished step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: PwStep,
    pub uid: String,
    pub report: CalcReport,
    pub outdir: FileRef,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub status: CalcStatus,
    /// First step that reported failure, if any
    pub failed_step: Option<PwStep>,
    pub steps: Vec<StepResult>,
}

impl PipelineOutcome {
    pub fn uids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.uid.as_str()).collect()
    }

    pub fn is_completed(&self) -> bool {
        self.status == CalcStatus::Completed
    }

    pub fn step(&self, step: PwStep) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step == step)
    }
}

fn kpoints_for(kpoints: &Value, step: PwStep) -> Value {
    let key = if step == PwStep::Bands { "path" } else { "grid" };
    match kpoints.get(key) {
        Some(selected) => selected.clone(),
        None => kpoints.clone(),
    }
}

fn run_step(
    engine: &Engine,
    calculator: &dyn Calculator,
    inputs: &PipelineInputs,
    step: PwStep,
    previous: Option<&FileRef>,
) -> Result<StepResult, StageError> {
    let mut args = TaskArgs::new();
    args.insert(
        "parameters".into(),
        pw::normalize(step, &inputs.parameters, &inputs.outdir)?.into(),
    );
    args.insert("species".into(), json!(inputs.species).into());
    args.insert("kpoints".into(), kpoints_for(&inputs.kpoints, step).into());
    args.insert(
        "pseudopotential_family".into(),
        json!(inputs.pseudopotential_family).into(),
    );
    if let Some(library) = &inputs.pseudo_library {
        let library = FileRef::working_dir(library.display().to_string())?;
        args.insert("pseudo_library".into(), TaskArg::File(library));
    }
    if let Some(outdir) = previous {
        let link = LinkSpec::symlink(outdir.clone(), &inputs.outdir)?
            .recursive(true)
            .overwrite(true);
        args.insert("outdir".into(), link.into());
    }

    let outputs = pw::pw_task(engine, step, calculator)?.call(args)?;
    let outputs = Value::Object(outputs);
    let report: CalcReport = serde_json::from_value(outputs.clone())?;
    let outdir: FileRef = serde_json::from_value(outputs["outdir"].clone())?;
    Ok(StepResult {
        step,
        uid: outdir.owner_uid().to_string(),
        report,
        outdir,
    })
}

/// Run the three steps in order, halting at the first failed calculation
pub fn run_scf_nscf_bands(
    engine: &Engine,
    calculator: &dyn Calculator,
    inputs: &PipelineInputs,
) -> Result<PipelineOutcome, StageError> {
    let mut steps: Vec<StepResult> = Vec::new();
    for step in [PwStep::Scf, PwStep::Nscf, PwStep::Bands] {
        let previous = steps.last().map(|s| &s.outdir);
        let result = run_step(engine, calculator, inputs, step, previous)?;
        let failed = !result.report.is_completed();
        info!(uid = %result.uid, status = ?result.report.status, "step finished");
        steps.push(result);
        if failed {
            warn!(%step, "calculation failed, halting pipeline");
            return Ok(PipelineOutcome {
                status: CalcStatus::Failed,
                failed_step: Some(step),
                steps,
            });
        }
    }
    Ok(PipelineOutcome {
        status: CalcStatus::Completed,
        failed_step: None,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kpoints_are_selected_per_step() {
        let kpoints = json!({"grid": [4, 4, 4], "path": "GXWLG"});
        assert_eq!(kpoints_for(&kpoints, PwStep::Scf), json!([4, 4, 4]));
        assert_eq!(kpoints_for(&kpoints, PwStep::Bands), json!("GXWLG"));

        let opaque = json!([[0.0, 0.0, 0.0, 1.0]]);
        assert_eq!(kpoints_for(&opaque, PwStep::Nscf), opaque);
    }
}
