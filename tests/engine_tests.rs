//! Task lifecycle: uid assignment, working directory reset, staging,
//! persisted inputs/outputs and failure behaviour.

use std::fs;
use std::io;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use stagehand::backend::{Backend, GraphBackend, LocalBackend};
use stagehand::engine::{INPUTS_FILE, OUTPUTS_FILE};
use stagehand::{
    Engine, FileRef, LinkSpec, Outputs, Requirement, Schema, StageError, TaskArg, TaskArgs,
};

fn local() -> (TempDir, Arc<LocalBackend>, Engine) {
    let tmp = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(tmp.path()));
    let engine = Engine::new(backend.clone());
    (tmp, backend, engine)
}

fn outputs(value: Value) -> Outputs {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("diverged after {0} iterations")]
struct Diverged(u32);

// ============================================================================
// UIDS
// ============================================================================

#[test]
fn uids_are_sequential_regardless_of_failure() {
    let (_tmp, _backend, engine) = local();

    engine.task("a", |_, _| Ok(Outputs::new())).call(TaskArgs::new()).unwrap();
    let err = engine
        .task("b", |_, _| Err(Diverged(3).into()))
        .call(TaskArgs::new())
        .unwrap_err();
    assert!(matches!(err, StageError::Task { ref uid, .. } if uid == "02-b"));
    engine.task("c", |_, _| Ok(Outputs::new())).call(TaskArgs::new()).unwrap();

    let uids: Vec<String> = engine.records().into_iter().map(|r| r.uid).collect();
    assert_eq!(uids, vec!["01-a", "02-b", "03-c"]);
}

#[test]
fn repeated_name_gets_a_new_uid_and_an_empty_directory() {
    let (tmp, backend, engine) = local();

    // leftovers from an earlier run under the same root
    fs::create_dir_all(tmp.path().join("02-scf")).unwrap();
    fs::write(tmp.path().join("02-scf/stale.txt"), "old").unwrap();

    let task = engine
        .task("scf", |ctx, _| {
            let uid = ctx.uid().unwrap();
            let backend = ctx.backend().unwrap();
            let stale = FileRef::file(uid, "stale.txt")?;
            let mut out = Outputs::new();
            out.insert("saw_stale".into(), json!(backend.exists(&stale)));
            backend.write_text("written", &stale)?;
            Ok(out)
        })
        .requires(Requirement::Uid)
        .requires(Requirement::Backend);

    let first = task.call(TaskArgs::new()).unwrap();
    let second = task.call(TaskArgs::new()).unwrap();
    assert_eq!(first["saw_stale"], false);
    assert_eq!(second["saw_stale"], false);

    let uids: Vec<String> = engine.records().into_iter().map(|r| r.uid).collect();
    assert_eq!(uids, vec!["01-scf", "02-scf"]);
    assert!(backend.exists(&FileRef::file("01-scf", "stale.txt").unwrap()));
}

#[test]
fn invalid_name_consumes_no_uid() {
    let (tmp, _backend, engine) = local();
    let err = engine
        .task("../escape", |_, _| Ok(Outputs::new()))
        .call(TaskArgs::new())
        .unwrap_err();
    assert!(matches!(err, StageError::InvalidTaskName { .. }));
    assert!(engine.records().is_empty());
    assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);

    engine.task("ok", |_, _| Ok(Outputs::new())).call(TaskArgs::new()).unwrap();
    assert_eq!(engine.records()[0].uid, "01-ok");
}

#[test]
fn fresh_engine_restarts_numbering() {
    let backend: Arc<dyn Backend> = Arc::new(GraphBackend::new());
    let first = Engine::new(backend.clone());
    first.task("x", |_, _| Ok(Outputs::new())).call(TaskArgs::new()).unwrap();
    let second = Engine::new(backend);
    second.task("x", |_, _| Ok(Outputs::new())).call(TaskArgs::new()).unwrap();
    assert_eq!(second.records()[0].uid, "01-x");
}

// ============================================================================
// INPUT VALIDATION AND STAGING
// ============================================================================

#[test]
fn input_validation_fails_before_any_mutation_but_keeps_the_uid() {
    let (tmp, _backend, engine) = local();
    let schema = Schema::new(json!({
        "type": "object",
        "properties": {"ecutwfc": {"type": "number"}},
        "required": ["ecutwfc"]
    }))
    .unwrap();

    let mut args = TaskArgs::new();
    args.insert("ecutwfc".into(), json!("thirty").into());
    let err = engine
        .task("scf", |_, _| Ok(Outputs::new()))
        .input_schema(schema)
        .call(args)
        .unwrap_err();

    assert!(matches!(err, StageError::InputValidation { ref uid, .. } if uid == "01-scf"));
    assert!(!tmp.path().join("01-scf").exists());
    assert_eq!(engine.records().len(), 1);
}

#[test]
fn links_are_staged_and_replaced_by_files() {
    let (tmp, backend, engine) = local();
    let producer = engine
        .task("scf", |ctx, _| {
            let backend = ctx.backend().unwrap();
            let outdir = FileRef::dir(ctx.uid().unwrap(), "tmp")?;
            backend.mkdir(&outdir, false, false)?;
            backend.write_text("rho", &outdir.join("charge.dat", false)?)?;
            let mut out = Outputs::new();
            out.insert("outdir".into(), serde_json::to_value(&outdir)?);
            Ok(out)
        })
        .requires(Requirement::Uid)
        .requires(Requirement::Backend);
    let out = producer.call(TaskArgs::new()).unwrap();
    let outdir: FileRef = serde_json::from_value(out["outdir"].clone()).unwrap();

    let mut args = TaskArgs::new();
    args.insert(
        "outdir".into(),
        LinkSpec::symlink(outdir, "tmp").unwrap().recursive(true).into(),
    );
    args.insert("label".into(), json!("nscf").into());

    let consumer = engine.task("nscf", |_, args| {
        let staged = args["outdir"].as_file().expect("link replaced by file");
        assert_eq!(staged, &FileRef::dir("02-nscf", "tmp")?);
        assert_eq!(args["label"], TaskArg::Value(json!("nscf")));
        Ok(Outputs::new())
    });
    consumer.call(args).unwrap();

    let rho = FileRef::file("02-nscf", "tmp/charge.dat").unwrap();
    assert_eq!(backend.read_text(&rho).unwrap(), "rho");

    let dumped: Value =
        serde_json::from_str(&fs::read_to_string(tmp.path().join("02-nscf").join(INPUTS_FILE)).unwrap())
            .unwrap();
    assert_eq!(
        dumped,
        json!({
            "label": "nscf",
            "outdir": {"owner_uid": "02-nscf", "path": "tmp", "is_dir": true}
        })
    );
}

#[test]
fn staging_a_missing_source_is_fatal() {
    let (_tmp, _backend, engine) = local();
    let mut args = TaskArgs::new();
    args.insert(
        "outdir".into(),
        LinkSpec::symlink(FileRef::dir("01-nowhere", "tmp").unwrap(), "tmp")
            .unwrap()
            .into(),
    );
    let err = engine
        .task("nscf", |_, _| Ok(Outputs::new()))
        .call(args)
        .unwrap_err();
    assert!(matches!(err, StageError::SourceMissing { .. }));
}

// ============================================================================
// PERSISTED INPUTS AND OUTPUTS
// ============================================================================

#[test]
fn outputs_round_trip_through_schema_minus_nulls() {
    let (tmp, _backend, engine) = local();
    let schema = Schema::new(json!({
        "type": "object",
        "required": ["status"],
        "properties": {"status": {"enum": ["COMPLETED", "FAILED"]}}
    }))
    .unwrap();

    let original = outputs(json!({
        "status": "COMPLETED",
        "error_message": null,
        "nested": {"kept": 1, "dropped": null},
        "list": [1, null, 3]
    }));
    let returned = original.clone();
    let out = engine
        .task("scf", move |_, _| Ok(returned.clone()))
        .output_schema(schema.clone())
        .call(TaskArgs::new())
        .unwrap();
    assert_eq!(out, original);

    let text = fs::read_to_string(tmp.path().join("01-scf").join(OUTPUTS_FILE)).unwrap();
    assert!(text.starts_with("{\n  \""));

    let loaded = engine.load_outputs("01-scf", Some(&schema)).unwrap();
    assert_eq!(
        Value::Object(loaded),
        json!({
            "status": "COMPLETED",
            "nested": {"kept": 1},
            "list": [1, null, 3]
        })
    );
}

#[test]
fn outputs_are_dumped_without_a_schema() {
    let backend = Arc::new(GraphBackend::new());
    let engine = Engine::new(backend.clone());
    engine
        .task("plain", |_, _| Ok(outputs(json!({"answer": 42}))))
        .call(TaskArgs::new())
        .unwrap();
    let text = backend
        .read_text(&FileRef::file("01-plain", OUTPUTS_FILE).unwrap())
        .unwrap();
    assert_eq!(text, "{\n  \"answer\": 42\n}");
    assert!(backend.exists(&FileRef::file("01-plain", INPUTS_FILE).unwrap()));
}

#[test]
fn failed_function_leaves_inputs_and_surfaces_the_error() {
    let (tmp, _backend, engine) = local();
    let mut args = TaskArgs::new();
    args.insert("iterations".into(), json!(7).into());

    let err = engine
        .task("scf", |_, args| {
            let n = args["iterations"].as_value().and_then(Value::as_u64).unwrap_or(0);
            Err(Diverged(n as u32).into())
        })
        .call(args)
        .unwrap_err();

    let workdir = tmp.path().join("01-scf");
    assert!(workdir.join(INPUTS_FILE).is_file());
    assert!(!workdir.join(OUTPUTS_FILE).exists());

    let source = err.task_source().unwrap();
    let diverged = source.downcast_ref::<Diverged>().unwrap();
    assert_eq!(diverged.0, 7);
}

/// Backend that refuses to write `inputs.json`
struct NoInputsDump(GraphBackend);

impl Backend for NoInputsDump {
    fn exists(&self, target: &FileRef) -> bool {
        self.0.exists(target)
    }
    fn resolves(&self, target: &FileRef) -> bool {
        self.0.resolves(target)
    }
    fn delete(&self, target: &FileRef) -> Result<(), StageError> {
        self.0.delete(target)
    }
    fn copy(&self, src: &FileRef, dest: &FileRef) -> Result<(), StageError> {
        self.0.copy(src, dest)
    }
    fn link(&self, src: &FileRef, dest: &FileRef, recursive: bool) -> Result<(), StageError> {
        self.0.link(src, dest, recursive)
    }
    fn is_dir(&self, target: &FileRef) -> bool {
        self.0.is_dir(target)
    }
    fn mkdir(&self, target: &FileRef, parents: bool, exist_ok: bool) -> Result<(), StageError> {
        self.0.mkdir(target, parents, exist_ok)
    }
    fn write_text(&self, content: &str, target: &FileRef) -> Result<(), StageError> {
        if target.name() == Some(INPUTS_FILE) {
            return Err(StageError::backend(
                "write",
                target,
                io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
            ));
        }
        self.0.write_text(content, target)
    }
    fn read_text(&self, target: &FileRef) -> Result<String, StageError> {
        self.0.read_text(target)
    }
}

#[test]
fn inputs_dump_failure_is_a_warning() {
    let engine = Engine::new(Arc::new(NoInputsDump(GraphBackend::new())));
    let out = engine
        .task("scf", |_, _| Ok(outputs(json!({"ok": true}))))
        .call(TaskArgs::new())
        .unwrap();
    assert_eq!(out["ok"], true);

    let record = &engine.records()[0];
    assert_eq!(record.warnings.len(), 1);
    assert!(record.warnings[0].contains(INPUTS_FILE));
    assert!(engine.backend().exists(&FileRef::file("01-scf", OUTPUTS_FILE).unwrap()));
}
