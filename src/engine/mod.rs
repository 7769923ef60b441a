//! # Task Engine
//!
//! Wraps a plain function in the task lifecycle: every call gets a fresh,
//! uniquely named working directory, its link arguments staged, and its
//! inputs and outputs persisted next to whatever the function writes.
//!
//! ## Lifecycle of [`TaskDef::call`]
//!
//! 1. assign the uid `NN-name`
//! 2. validate inputs (if an input schema is set)
//! 3. reset the working directory
//! 4. stage every [`TaskArg::Link`] and replace it with the staged file
//! 5. dump `inputs.json` (best effort)
//! 6. build the [`TaskContext`] from the declared [`Requirement`]s
//! 7. invoke the function
//! 8. validate outputs and dump `outputs.json`
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use stagehand::{Engine, GraphBackend, Requirement, TaskArgs};
//!
//! let engine = Engine::new(Arc::new(GraphBackend::new()));
//! let echo = engine
//!     .task("echo", |ctx, _args| {
//!         let mut out = stagehand::Outputs::new();
//!         out.insert("uid".into(), json!(ctx.uid()));
//!         Ok(out)
//!     })
//!     .requires(Requirement::Uid);
//!
//! let out = echo.call(TaskArgs::new()).unwrap();
//! assert_eq!(out["uid"], "01-echo");
//! ```

mod ledger;
mod schema;

pub use ledger::{uid_ordinal, TaskRecord, UidLedger};
pub use schema::Schema;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::backend::{self, Backend};
use crate::commands::CommandTable;
use crate::error::StageError;
use crate::file_ref::FileRef;
use crate::task_arg::{render_dump, snapshot, Outputs, TaskArg, TaskArgs};

pub const INPUTS_FILE: &str = "inputs.json";
pub const OUTPUTS_FILE: &str = "outputs.json";

/// Ambient values a task can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Requirement {
    /// The task's own uid
    Uid,
    /// The engine's [`CommandTable`]
    Commands,
    /// The backend the task runs on
    Backend,
}

/// What a task function sees besides its arguments.
///
/// Only declared requirements are filled in.
#[derive(Clone, Default)]
pub struct TaskContext {
    uid: Option<String>,
    commands: Option<Arc<CommandTable>>,
    backend: Option<Arc<dyn Backend>>,
}

impl TaskContext {
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn commands(&self) -> Option<&CommandTable> {
        self.commands.as_deref()
    }

    pub fn backend(&self) -> Option<&dyn Backend> {
        self.backend.as_deref()
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("uid", &self.uid)
            .field("commands", &self.commands)
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

type TaskFn<'e> = dyn Fn(&TaskContext, TaskArgs) -> anyhow::Result<Outputs> + 'e;

/// Runs tasks on one backend and numbers them
pub struct Engine {
    backend: Arc<dyn Backend>,
    commands: Arc<CommandTable>,
    ledger: UidLedger,
}

impl Engine {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            commands: Arc::new(CommandTable::new()),
            ledger: UidLedger::new(),
        }
    }

    pub fn with_commands(mut self, commands: CommandTable) -> Self {
        self.commands = Arc::new(commands);
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    /// Every task call so far, in call order
    pub fn records(&self) -> Vec<TaskRecord> {
        self.ledger.records()
    }

    /// Wrap `function` as a task named `name`
    pub fn task<'e, F>(&'e self, name: impl Into<String>, function: F) -> TaskDef<'e>
    where
        F: Fn(&TaskContext, TaskArgs) -> anyhow::Result<Outputs> + 'e,
    {
        TaskDef {
            engine: self,
            name: name.into(),
            function: Box::new(function),
            requires: Vec::new(),
            input_schema: None,
            output_schema: None,
        }
    }

    /// Read a task's `outputs.json` back, validating it if a schema is given
    pub fn load_outputs(&self, uid: &str, schema: Option<&Schema>) -> Result<Outputs, StageError> {
        let file = FileRef::file(uid, OUTPUTS_FILE)?;
        let text = self.backend.read_text(&file)?;
        let outputs: Outputs = serde_json::from_str(&text)?;
        if let Some(schema) = schema {
            schema
                .check(&Value::Object(outputs.clone()))
                .map_err(|details| StageError::OutputValidation {
                    uid: uid.to_string(),
                    details,
                })?;
        }
        Ok(outputs)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("commands", &self.commands)
            .field("tasks", &self.ledger.len())
            .finish()
    }
}

/// A function bound to an engine, with its declared requirements and schemas
pub struct TaskDef<'e> {
    engine: &'e Engine,
    name: String,
    function: Box<TaskFn<'e>>,
    requires: Vec<Requirement>,
    input_schema: Option<Schema>,
    output_schema: Option<Schema>,
}

impl<'e> TaskDef<'e> {
    pub fn requires(mut self, requirement: Requirement) -> Self {
        if !self.requires.contains(&requirement) {
            self.requires.push(requirement);
        }
        self
    }

    pub fn input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the full lifecycle once
    #[instrument(skip(self, args), fields(task = %self.name))]
    pub fn call(&self, mut args: TaskArgs) -> Result<Outputs, StageError> {
        let backend = self.engine.backend.as_ref();

        let uid = self.engine.ledger.assign(&self.name)?;
        debug!(%uid, "uid assigned");

        if let Some(schema) = &self.input_schema {
            self.validate_inputs(schema, &uid, &mut args)?;
        }

        let workdir = FileRef::working_dir(&uid)?;
        if backend.exists(&workdir) {
            debug!(%uid, "clearing stale working directory");
            backend.delete(&workdir)?;
        }
        backend.mkdir(&workdir, true, true)?;

        for arg in args.values_mut() {
            if let TaskArg::Link(spec) = arg {
                let staged = backend::stage(backend, spec, &uid)?;
                *arg = TaskArg::File(staged);
            }
        }
        debug!(%uid, args = args.len(), "inputs staged");

        if let Err(e) = self.dump(&uid, INPUTS_FILE, &snapshot(&args)) {
            warn!(%uid, error = %e, "could not write {INPUTS_FILE}");
            self.engine
                .ledger
                .warn(&uid, format!("{INPUTS_FILE} not written: {e}"));
        }

        let ctx = self.context(&uid);
        let outputs = (self.function)(&ctx, args).map_err(|source| StageError::Task {
            uid: uid.clone(),
            source,
        })?;

        if let Some(schema) = &self.output_schema {
            schema
                .check(&Value::Object(outputs.clone()))
                .map_err(|details| StageError::OutputValidation {
                    uid: uid.clone(),
                    details,
                })?;
        }
        self.dump(&uid, OUTPUTS_FILE, &Value::Object(outputs.clone()))?;

        info!(%uid, "task completed");
        Ok(outputs)
    }

    /// Fill schema defaults into `args` and check the result
    fn validate_inputs(
        &self,
        schema: &Schema,
        uid: &str,
        args: &mut TaskArgs,
    ) -> Result<(), StageError> {
        let mut snap = snapshot(args);
        schema.apply_defaults(&mut snap);
        schema
            .check(&snap)
            .map_err(|details| StageError::InputValidation {
                uid: uid.to_string(),
                details,
            })?;
        if let Value::Object(filled) = snap {
            for (key, value) in filled {
                args.entry(key).or_insert(TaskArg::Value(value));
            }
        }
        Ok(())
    }

    fn context(&self, uid: &str) -> TaskContext {
        let mut ctx = TaskContext::default();
        for requirement in &self.requires {
            match requirement {
                Requirement::Uid => ctx.uid = Some(uid.to_string()),
                Requirement::Commands => ctx.commands = Some(Arc::clone(&self.engine.commands)),
                Requirement::Backend => ctx.backend = Some(Arc::clone(&self.engine.backend)),
            }
        }
        ctx
    }

    fn dump(&self, uid: &str, file: &str, value: &Value) -> Result<(), StageError> {
        let text = render_dump(value)?;
        let target = FileRef::file(uid, file)?;
        self.engine.backend.write_text(&text, &target)
    }
}

impl fmt::Debug for TaskDef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDef")
            .field("name", &self.name)
            .field("requires", &self.requires)
            .field("input_schema", &self.input_schema.is_some())
            .field("output_schema", &self.output_schema.is_some())
            .finish()
    }
}
