//! pw.x task definitions
//!
//! Parameter normalisation, per-step requirements, input rendering and the
//! task function shared by the scf, nscf and bands steps. Physics stays
//! opaque: k-points and species pass through as JSON.

use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Write as _;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::backend::stage_link;
use crate::calc::{CalcRequest, Calculator};
use crate::engine::{Engine, Requirement, Schema, TaskContext, TaskDef};
use crate::error::StageError;
use crate::file_ref::FileRef;
use crate::task_arg::{Outputs, TaskArg, TaskArgs};

pub const PROGRAM: &str = "pw";
pub const INPUT_FILE: &str = "espresso.pwi";
pub const PSEUDO_DIR: &str = "pseudopotentials";
pub const PREFIX: &str = "espresso";

/// `system` keys passed through to the program
const SYSTEM_KEYS: [&str; 4] = ["ibrav", "ecutwfc", "nat", "ntyp"];

/// Namelists rendered first, in this order; the rest follow alphabetically
const NAMELIST_ORDER: [&str; 5] = ["control", "system", "electrons", "ions", "cell"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PwStep {
    Scf,
    Nscf,
    Bands,
}

impl PwStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PwStep::Scf => "scf",
            PwStep::Nscf => "nscf",
            PwStep::Bands => "bands",
        }
    }

    /// nscf and bands restart from an scf charge density
    pub fn is_restart(&self) -> bool {
        !matches!(self, PwStep::Scf)
    }
}

impl fmt::Display for PwStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters do not satisfy what a step needs
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Requirement failed: {0}")]
pub struct RequirementFailed(pub String);

// ============================================================================
// NORMALISATION AND REQUIREMENTS
// ============================================================================

fn section<'a>(params: &'a mut Map<String, Value>, name: &str) -> Option<&'a mut Map<String, Value>> {
    if !matches!(params.get(name), Some(Value::Object(_))) {
        params.insert(name.to_string(), Value::Object(Map::new()));
    }
    params.get_mut(name).and_then(Value::as_object_mut)
}

/// Fill in the fixed control values for `step` and trim `system` to the
/// supported keys
pub fn normalize(step: PwStep, parameters: &Value, outdir: &str) -> Result<Value, StageError> {
    let Value::Object(mut params) = parameters.clone() else {
        return Err(StageError::Config("pw parameters must be a mapping".into()));
    };

    if let Some(control) = section(&mut params, "control") {
        control.insert("calculation".into(), json!(step.as_str()));
        if step.is_restart() {
            control.insert("restart_mode".into(), json!("restart"));
        }
        control.insert("pseudo_dir".into(), json!(PSEUDO_DIR));
        control.insert("outdir".into(), json!(outdir));
        control.insert("prefix".into(), json!(PREFIX));
    }
    if let Some(system) = section(&mut params, "system") {
        system.retain(|key, _| SYSTEM_KEYS.contains(&key.as_str()));
    }
    Ok(Value::Object(params))
}

/// Check the parameters are fit for `step`
pub fn check_requirements(step: PwStep, parameters: &Value) -> Result<(), RequirementFailed> {
    let control = &parameters["control"];
    if control["calculation"].as_str() != Some(step.as_str()) {
        return Err(RequirementFailed(format!(
            "Calculation type must be \"{}\"",
            step.as_str()
        )));
    }
    if step.is_restart() && control["restart_mode"].as_str() != Some("restart") {
        return Err(RequirementFailed(
            "`restart_mode` must be set to \"restart\"".into(),
        ));
    }
    Ok(())
}

// ============================================================================
// INPUT RENDERING
// ============================================================================

fn fortran_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Bool(true) => Some(".true.".into()),
        Value::Bool(false) => Some(".false.".into()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(format!("'{}'", s.replace('\'', "''"))),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Render parameters as Fortran namelists, with species and k-points in a
/// trailing comment block
pub fn render_input(parameters: &Value, species: &[String], kpoints: &Value) -> String {
    let mut out = String::new();
    let Some(params) = parameters.as_object() else {
        return out;
    };

    let mut names: Vec<&str> = NAMELIST_ORDER
        .iter()
        .copied()
        .filter(|name| params.contains_key(*name))
        .collect();
    names.extend(
        params
            .keys()
            .map(String::as_str)
            .filter(|name| !NAMELIST_ORDER.contains(name)),
    );

    for name in names {
        let Some(entries) = params[name].as_object() else {
            continue;
        };
        let _ = writeln!(out, "&{}", name.to_uppercase());
        for (key, value) in entries {
            match value {
                Value::Array(items) => {
                    for (i, item) in items.iter().enumerate() {
                        if let Some(v) = fortran_scalar(item) {
                            let _ = writeln!(out, "   {key}({}) = {v}", i + 1);
                        }
                    }
                }
                other => {
                    if let Some(v) = fortran_scalar(other) {
                        let _ = writeln!(out, "   {key} = {v}");
                    }
                }
            }
        }
        out.push_str("/\n");
    }

    let _ = writeln!(out, "! species: {}", json!(species));
    let _ = writeln!(out, "! kpoints: {kpoints}");
    out
}

// ============================================================================
// SCHEMAS
// ============================================================================

pub fn input_schema() -> Result<Schema, StageError> {
    Schema::new(json!({
        "type": "object",
        "required": ["parameters", "species"],
        "properties": {
            "parameters": {"type": "object", "required": ["control"]},
            "species": {"type": "array", "items": {"type": "string"}},
            "pseudopotential_family": {"type": "string", "default": "SSSP_1.3_PBE_efficiency"}
        }
    }))
}

pub fn output_schema() -> Result<Schema, StageError> {
    Schema::new(json!({
        "type": "object",
        "required": ["status", "walltime_s", "outdir"],
        "properties": {
            "status": {"enum": ["COMPLETED", "FAILED"]},
            "error_message": {"type": ["string", "null"]},
            "error_kind": {"type": ["string", "null"]},
            "walltime_s": {"type": "number"},
            "outdir": {
                "type": "object",
                "required": ["owner_uid", "path", "is_dir"]
            }
        }
    }))
}

// ============================================================================
// TASK
// ============================================================================

/// The pw task for one step, run through `calculator`
pub fn pw_task<'e>(
    engine: &'e Engine,
    step: PwStep,
    calculator: &'e dyn Calculator,
) -> Result<TaskDef<'e>, StageError> {
    Ok(engine
        .task(step.as_str(), move |ctx, args| run_pw(ctx, args, step, calculator))
        .requires(Requirement::Uid)
        .requires(Requirement::Commands)
        .requires(Requirement::Backend)
        .input_schema(input_schema()?)
        .output_schema(output_schema()?))
}

fn value_arg<'a>(args: &'a TaskArgs, key: &str) -> anyhow::Result<&'a Value> {
    args.get(key)
        .and_then(TaskArg::as_value)
        .with_context(|| format!("argument '{key}' must be a value"))
}

fn run_pw(
    ctx: &TaskContext,
    args: TaskArgs,
    step: PwStep,
    calculator: &dyn Calculator,
) -> anyhow::Result<Outputs> {
    let uid = ctx.uid().context("uid was not provided")?;
    let backend = ctx.backend().context("backend was not provided")?;

    let parameters = value_arg(&args, "parameters")?;
    check_requirements(step, parameters)?;
    let outdir = parameters["control"]["outdir"]
        .as_str()
        .unwrap_or("tmp")
        .to_string();

    let species: Vec<String> = serde_json::from_value(value_arg(&args, "species")?.clone())
        .context("species must be a list of symbols")?;
    let kpoints = args
        .get("kpoints")
        .and_then(TaskArg::as_value)
        .cloned()
        .unwrap_or(Value::Null);

    let input = render_input(parameters, &species, &kpoints);
    backend.write_text(&input, &FileRef::file(uid, INPUT_FILE)?)?;

    if let Some(library) = args.get("pseudo_library").and_then(TaskArg::as_file) {
        let family = value_arg(&args, "pseudopotential_family")?
            .as_str()
            .context("pseudopotential_family must be a string")?;
        let pseudo_dir = FileRef::dir(uid, PSEUDO_DIR)?;
        backend.mkdir(&pseudo_dir, true, true)?;
        let symbols: BTreeSet<&str> = species.iter().map(String::as_str).collect();
        for symbol in symbols {
            let file = format!("{symbol}.upf");
            let src = library.join(format!("{family}/{file}"), false)?;
            let dest = pseudo_dir.join(&file, false)?;
            debug!(%src, %dest, "linking pseudopotential");
            stage_link(backend, &src, &dest, false, true)?;
        }
    }

    let request = CalcRequest {
        uid: uid.to_string(),
        program: PROGRAM.to_string(),
        command: ctx
            .commands()
            .and_then(|c| c.get(PROGRAM))
            .map(String::from),
        calculation: step.as_str().to_string(),
        input_file: INPUT_FILE.to_string(),
        input,
        outdir: outdir.clone(),
        prefix: PREFIX.to_string(),
    };
    let report = calculator.calculate(&request)?;

    let mut outputs = match serde_json::to_value(&report)? {
        Value::Object(map) => map,
        _ => Outputs::new(),
    };
    outputs.insert(
        "outdir".into(),
        serde_json::to_value(FileRef::dir(uid, &outdir)?)?,
    );
    Ok(outputs)
}
