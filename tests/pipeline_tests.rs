//! scf -> nscf -> bands with the mock calculator on both backends
#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use stagehand::backend::{Backend, GraphBackend, GraphEntryKind, LocalBackend};
use stagehand::calc::CHARGE_DENSITY;
use stagehand::pw::PwStep;
use stagehand::{
    run_scf_nscf_bands, CalcStatus, Engine, FileRef, MockCalculator, PipelineInputs, StageError,
};

const FAMILY: &str = "SSSP_1.3_PBE_efficiency";

fn inputs(library: Option<PathBuf>) -> PipelineInputs {
    PipelineInputs {
        species: vec!["Si".into()],
        pseudopotential_family: FAMILY.into(),
        parameters: json!({
            "system": {"ecutwfc": 30, "ibrav": 2, "nat": 2, "ntyp": 1, "nbnd": 8}
        }),
        kpoints: json!({"grid": [4, 4, 4], "path": "GXWLG"}),
        pseudo_library: library,
        outdir: "tmp".into(),
    }
}

fn pseudo_library() -> TempDir {
    let library = TempDir::new().unwrap();
    fs::create_dir_all(library.path().join(FAMILY)).unwrap();
    fs::write(library.path().join(FAMILY).join("Si.upf"), "<UPF Si/>").unwrap();
    library
}

fn density(uid: &str) -> String {
    format!("{uid}/tmp/espresso.save/{CHARGE_DENSITY}")
}

// ============================================================================
// LOCAL BACKEND
// ============================================================================

#[test]
fn local_pipeline_chains_restart_data() {
    let root = TempDir::new().unwrap();
    let library = pseudo_library();
    let backend = Arc::new(LocalBackend::new(root.path()));
    let engine = Engine::new(backend.clone());
    let calculator = MockCalculator::new(backend.clone());

    let outcome =
        run_scf_nscf_bands(&engine, &calculator, &inputs(Some(library.path().into()))).unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.failed_step, None);
    assert_eq!(outcome.uids(), vec!["01-scf", "02-nscf", "03-bands"]);

    // every restart step links straight to the scf density
    for uid in ["02-nscf", "03-bands"] {
        let link = root.path().join(density(uid));
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        let resolved = fs::canonicalize(&link).unwrap();
        assert_eq!(resolved, fs::canonicalize(root.path().join(density("01-scf"))).unwrap());
    }
    assert_eq!(
        fs::read_to_string(root.path().join(density("03-bands"))).unwrap(),
        "charge density from 01-scf\n"
    );

    // nscf output reaches bands through the chain, bands output stays local
    let bands_save = root.path().join("03-bands/tmp/espresso.save");
    assert!(fs::symlink_metadata(bands_save.join("nscf.dat"))
        .unwrap()
        .file_type()
        .is_symlink());
    assert!(!fs::symlink_metadata(bands_save.join("bands.dat"))
        .unwrap()
        .file_type()
        .is_symlink());

    for uid in outcome.uids() {
        let dir = root.path().join(uid);
        let outputs: Value =
            serde_json::from_str(&fs::read_to_string(dir.join("outputs.json")).unwrap()).unwrap();
        assert_eq!(outputs["status"], "COMPLETED");
        assert_eq!(outputs["outdir"]["owner_uid"], uid);
        assert!(dir.join("espresso.pwo").is_file());
        assert_eq!(
            fs::read_to_string(dir.join("pseudopotentials/Si.upf")).unwrap(),
            "<UPF Si/>"
        );
    }

    let requests = calculator.requests();
    let calcs: Vec<&str> = requests.iter().map(|r| r.calculation.as_str()).collect();
    assert_eq!(calcs, vec!["scf", "nscf", "bands"]);
}

#[test]
fn local_inputs_record_staged_files_and_rendered_parameters() {
    let root = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(root.path()));
    let engine = Engine::new(backend.clone());
    let calculator = MockCalculator::new(backend.clone());
    run_scf_nscf_bands(&engine, &calculator, &inputs(None)).unwrap();

    let dumped: Value = serde_json::from_str(
        &fs::read_to_string(root.path().join("02-nscf/inputs.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(
        dumped["outdir"],
        json!({"owner_uid": "02-nscf", "path": "tmp", "is_dir": true})
    );
    assert_eq!(dumped["parameters"]["control"]["restart_mode"], "restart");
    assert_eq!(dumped["kpoints"], json!([4, 4, 4]));
    assert_eq!(dumped["pseudopotential_family"], FAMILY);
    assert!(dumped["parameters"]["system"].get("nbnd").is_none());

    let pwi = fs::read_to_string(root.path().join("03-bands/espresso.pwi")).unwrap();
    assert!(pwi.starts_with("&CONTROL\n"));
    assert!(pwi.contains("   calculation = 'bands'\n"));
    assert!(pwi.contains("   outdir = 'tmp'\n"));
    assert!(pwi.contains("! kpoints: \"GXWLG\""));
    assert!(!root.path().join("03-bands/pseudopotentials").exists());
}

#[test]
fn failed_step_halts_the_pipeline() {
    let root = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(root.path()));
    let engine = Engine::new(backend.clone());
    let calculator = MockCalculator::new(backend.clone()).fail_on("nscf");

    let outcome = run_scf_nscf_bands(&engine, &calculator, &inputs(None)).unwrap();
    assert_eq!(outcome.status, CalcStatus::Failed);
    assert_eq!(outcome.failed_step, Some(PwStep::Nscf));
    assert_eq!(outcome.uids(), vec!["01-scf", "02-nscf"]);

    let nscf = outcome.step(PwStep::Nscf).unwrap();
    assert!(nscf.report.error_message.as_deref().unwrap().contains("nscf"));
    // a failed calculation is still a completed task
    let outputs = fs::read_to_string(root.path().join("02-nscf/outputs.json")).unwrap();
    assert!(outputs.contains("\"FAILED\""));
    assert!(!root.path().join("03-bands").exists());
    assert_eq!(calculator.requests().len(), 2);
}

#[test]
fn missing_pseudopotential_is_a_task_error() {
    let root = TempDir::new().unwrap();
    let library = TempDir::new().unwrap();
    fs::create_dir_all(library.path().join(FAMILY)).unwrap();

    let backend = Arc::new(LocalBackend::new(root.path()));
    let engine = Engine::new(backend.clone());
    let calculator = MockCalculator::new(backend.clone());
    let err =
        run_scf_nscf_bands(&engine, &calculator, &inputs(Some(library.path().into()))).unwrap_err();

    assert!(matches!(err, StageError::Task { ref uid, .. } if uid == "01-scf"));
    let source = err.task_source().unwrap().downcast_ref::<StageError>().unwrap();
    assert!(matches!(source, StageError::SourceMissing { .. }));
    assert!(calculator.requests().is_empty());
    assert!(root.path().join("01-scf/inputs.json").is_file());
}

// ============================================================================
// GRAPH BACKEND
// ============================================================================

#[test]
fn graph_pipeline_records_provenance() {
    let library = Path::new("/opt/pseudos");
    let graph = Arc::new(GraphBackend::new());
    graph
        .import_text(
            "<UPF Si/>",
            &FileRef::file(library.display().to_string(), format!("{FAMILY}/Si.upf")).unwrap(),
        )
        .unwrap();
    let engine = Engine::new(graph.clone());
    let calculator = MockCalculator::new(graph.clone());

    let outcome =
        run_scf_nscf_bands(&engine, &calculator, &inputs(Some(library.to_path_buf()))).unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.uids(), vec!["01-scf", "02-nscf", "03-bands"]);

    let bands_density = FileRef::file("03-bands", format!("tmp/espresso.save/{CHARGE_DENSITY}")).unwrap();
    assert_eq!(graph.read_text(&bands_density).unwrap(), "charge density from 01-scf\n");

    let entry = graph
        .entries("03-bands")
        .into_iter()
        .find(|e| e.path == Path::new("tmp/espresso.save").join(CHARGE_DENSITY))
        .unwrap();
    assert_eq!(
        entry.node,
        GraphEntryKind::Link {
            target: format!("01-scf:tmp/espresso.save/{CHARGE_DENSITY}")
        }
    );

    assert_eq!(graph.upstream("02-nscf"), vec!["/opt/pseudos", "01-scf"]);
    assert_eq!(graph.upstream("03-bands"), vec!["/opt/pseudos", "02-nscf"]);
    assert_eq!(graph.downstream("01-scf"), vec!["02-nscf"]);
    assert!(graph.owners().contains(&"/opt/pseudos".to_string()));

    let snapshot = graph.to_json();
    assert!(snapshot["edges"]
        .as_array()
        .unwrap()
        .contains(&json!({"from": "02-nscf", "to": "03-bands"})));
    assert!(!snapshot["events"].as_array().unwrap().is_empty());
}

#[test]
fn both_backends_produce_the_same_outputs() {
    let root = TempDir::new().unwrap();
    let local = Arc::new(LocalBackend::new(root.path()));
    let graph = Arc::new(GraphBackend::new());

    let mut seen = Vec::new();
    for backend in [local as Arc<dyn Backend>, graph] {
        let engine = Engine::new(backend.clone());
        let calculator = MockCalculator::new(backend.clone()).with_walltime(1.5);
        let outcome = run_scf_nscf_bands(&engine, &calculator, &inputs(None)).unwrap();
        let dumps: Vec<String> = outcome
            .uids()
            .iter()
            .flat_map(|uid| {
                ["inputs.json", "outputs.json", "espresso.pwi"]
                    .map(|name| backend.read_text(&FileRef::file(*uid, name).unwrap()).unwrap())
            })
            .collect();
        seen.push(dumps);
    }
    assert_eq!(seen[0], seen[1]);
    assert!(seen[0][1].contains("\"walltime_s\": 1.5"));
}
