//! Tagged task arguments
//!
//! Every argument passed to a task says what it is: plain data, a reference
//! to an existing file, or a directive to stage a file before the task runs.
//! The engine switches on the tag and never guesses from the shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::file_ref::{FileRef, LinkSpec};

/// Named task arguments, ordered for a stable `inputs.json`
pub type TaskArgs = BTreeMap<String, TaskArg>;

/// Task outputs as a plain JSON mapping
pub type Outputs = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum TaskArg {
    /// Plain data, passed through untouched
    Value(Value),
    /// A file or directory the task reads in place
    File(FileRef),
    /// Staged into the working directory before the task runs
    Link(LinkSpec),
}

impl TaskArg {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            TaskArg::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileRef> {
        match self {
            TaskArg::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&LinkSpec> {
        match self {
            TaskArg::Link(l) => Some(l),
            _ => None,
        }
    }

    /// Untagged JSON form used in `inputs.json`
    pub fn to_snapshot(&self) -> Value {
        match self {
            TaskArg::Value(v) => v.clone(),
            // FileRef and LinkSpec serialization cannot fail: plain fields only
            TaskArg::File(f) => serde_json::to_value(f).unwrap_or(Value::Null),
            TaskArg::Link(l) => serde_json::to_value(l).unwrap_or(Value::Null),
        }
    }
}

impl From<Value> for TaskArg {
    fn from(value: Value) -> Self {
        TaskArg::Value(value)
    }
}

impl From<FileRef> for TaskArg {
    fn from(file: FileRef) -> Self {
        TaskArg::File(file)
    }
}

impl From<LinkSpec> for TaskArg {
    fn from(link: LinkSpec) -> Self {
        TaskArg::Link(link)
    }
}

/// JSON object holding the untagged form of every argument
pub fn snapshot(args: &TaskArgs) -> Value {
    Value::Object(
        args.iter()
            .map(|(k, v)| (k.clone(), v.to_snapshot()))
            .collect(),
    )
}

/// Recursively drop object fields whose value is `null`.
///
/// Array elements are kept as they are.
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// Text written to `inputs.json` / `outputs.json`
pub fn render_dump(value: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&strip_nulls(value.clone()))
}
