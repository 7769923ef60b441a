//! Stagehand CLI - run and inspect staged calculation pipelines

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use walkdir::WalkDir;

use stagehand::config::{BackendKind, CalculatorKind, Config};
use stagehand::engine::{uid_ordinal, OUTPUTS_FILE};
use stagehand::pipeline::{run_scf_nscf_bands, PipelineInputs, PipelineOutcome};
use stagehand::{
    Calculator, Engine, FileRef, FixSuggestion, GraphBackend, LocalBackend, MockCalculator,
    ProgramCalculator, StageError,
};

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Stagehand - staged scf/nscf/bands pipelines on local or provenance backends")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scf -> nscf -> bands pipeline
    Run {
        /// Path to the YAML config
        config: PathBuf,

        /// Override the backend (local, graph)
        #[arg(short, long, value_enum)]
        backend: Option<BackendKind>,

        /// Override the working directory root
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Print the provenance graph as JSON (graph backend)
        #[arg(long)]
        provenance: bool,
    },

    /// Validate a config file without running anything
    Validate {
        /// Path to the YAML config
        config: PathBuf,
    },

    /// List task working directories under a root
    List {
        /// Working directory root
        root: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            backend,
            root,
            provenance,
        } => run_pipeline(&config, backend, root, provenance),
        Commands::Validate { config } => validate_config(&config).map(|_| true),
        Commands::List { root } => list_tasks(&root).map(|_| true),
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let Some(suggestion) = e.fix_suggestion() {
                eprintln!("  {} {}", "Fix:".yellow(), suggestion);
            }
            process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when a calculation reported failure
fn run_pipeline(
    path: &Path,
    backend: Option<BackendKind>,
    root: Option<PathBuf>,
    provenance: bool,
) -> Result<bool, StageError> {
    let mut config = Config::load(path)?;
    if let Some(backend) = backend {
        config.backend = backend;
    }
    if let Some(root) = root {
        config.root = root;
    }
    config.validate()?;
    let inputs = config.pipeline_inputs()?;

    println!(
        "{} backend: {} | calculator: {} | root: {}",
        "→".cyan(),
        format!("{:?}", config.backend).to_lowercase().cyan().bold(),
        format!("{:?}", config.calculator).to_lowercase().cyan(),
        config.root.display()
    );

    let outcome = match config.backend {
        BackendKind::Local => {
            fs::create_dir_all(&config.root)?;
            let backend = Arc::new(LocalBackend::new(&config.root));
            let engine = Engine::new(backend.clone()).with_commands(config.commands.clone());
            let calculator: Box<dyn Calculator> = match config.calculator {
                CalculatorKind::Program => {
                    Box::new(ProgramCalculator::new(&config.root).with_timeout(config.timeout()))
                }
                CalculatorKind::Mock => Box::new(MockCalculator::new(backend)),
            };
            let outcome = run_scf_nscf_bands(&engine, calculator.as_ref(), &inputs)?;
            if provenance {
                println!(
                    "{} provenance is only recorded by the graph backend",
                    "!".yellow()
                );
            }
            outcome
        }
        BackendKind::Graph => {
            let graph = Arc::new(GraphBackend::new());
            if let Some(library) = &inputs.pseudo_library {
                import_library(&graph, library, &inputs)?;
            }
            let engine = Engine::new(graph.clone()).with_commands(config.commands.clone());
            let calculator = MockCalculator::new(graph.clone());
            let outcome = run_scf_nscf_bands(&engine, &calculator, &inputs)?;
            if provenance {
                println!("{}", serde_json::to_string_pretty(&graph.to_json())?);
            }
            outcome
        }
    };

    print_outcome(&outcome);
    Ok(outcome.is_completed())
}

/// Seed the graph with the pseudopotential family from the host library
fn import_library(
    graph: &GraphBackend,
    library: &Path,
    inputs: &PipelineInputs,
) -> Result<(), StageError> {
    let owner = library.display().to_string();
    let family = library.join(&inputs.pseudopotential_family);
    for entry in WalkDir::new(&family).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(library)
            .map_err(|e| StageError::Config(e.to_string()))?;
        let content = fs::read_to_string(entry.path())?;
        graph.import_text(&content, &FileRef::file(owner.as_str(), rel)?)?;
    }
    Ok(())
}

fn print_outcome(outcome: &PipelineOutcome) {
    for step in &outcome.steps {
        let mark = if step.report.is_completed() {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "  {} {:<10} {:?} ({:.1}s)",
            mark, step.uid, step.report.status, step.report.walltime_s
        );
        if let Some(message) = &step.report.error_message {
            println!("      {}", message.red());
        }
    }
    match outcome.failed_step {
        None => println!("{} pipeline completed", "✓".green()),
        Some(step) => println!("{} pipeline halted at {}", "✗".red().bold(), step),
    }
}

fn validate_config(path: &Path) -> Result<(), StageError> {
    let config = Config::load(path)?;
    config.validate()?;

    println!("{} Config '{}' is valid", "✓".green(), path.display());
    println!("  Backend: {:?}", config.backend);
    println!("  Calculator: {:?}", config.calculator);
    println!("  Root: {}", config.root.display());
    println!("  Species: {}", config.pipeline.species.join(", "));
    println!("  Commands: {}", config.commands.len());

    Ok(())
}

fn list_tasks(root: &Path) -> Result<(), StageError> {
    let pattern = root.join("[0-9]*-*");
    let pattern = pattern.to_string_lossy();
    let paths = glob::glob(&pattern).map_err(|e| StageError::Config(e.to_string()))?;

    let mut tasks = Vec::new();
    for path in paths {
        let path = path.map_err(|e| e.into_error())?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(ordinal) = uid_ordinal(&name) {
            if path.is_dir() {
                tasks.push((ordinal, name, path));
            }
        }
    }
    tasks.sort();

    for (_, name, path) in &tasks {
        if path.join(OUTPUTS_FILE).is_file() {
            println!("  {} {}", "✓".green(), name);
        } else {
            println!("  {} {} {}", "✗".red(), name, "(incomplete)".dimmed());
        }
    }
    if tasks.is_empty() {
        println!("{} no task directories under {}", "!".yellow(), root.display());
    }
    Ok(())
}
