//! Compiled JSON Schemas for task inputs and outputs

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::StageError;

/// A JSON Schema compiled once with `jsonschema`
#[derive(Clone)]
pub struct Schema {
    raw: Value,
    compiled: Arc<jsonschema::Validator>,
}

impl Schema {
    pub fn new(raw: Value) -> Result<Self, StageError> {
        let compiled = jsonschema::validator_for(&raw).map_err(|e| StageError::InvalidSchema {
            details: e.to_string(),
        })?;
        Ok(Self {
            raw,
            compiled: Arc::new(compiled),
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// All violations joined with `"; "`, or `Ok` when the value conforms
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let errors: Vec<String> = self
            .compiled
            .iter_errors(value)
            .map(|e| {
                let at = e.instance_path.to_string();
                if at.is_empty() {
                    e.to_string()
                } else {
                    format!("{at}: {e}")
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    /// Fill absent top-level properties from their `default`.
    ///
    /// Only `properties.*.default` of an object schema is considered; nested
    /// defaults are left to the task.
    pub fn apply_defaults(&self, value: &mut Value) {
        let (Some(props), Value::Object(target)) = (
            self.raw.get("properties").and_then(Value::as_object),
            value,
        ) else {
            return;
        };
        for (key, prop) in props {
            if let Some(default) = prop.get("default") {
                if !target.contains_key(key) {
                    target.insert(key.clone(), default.clone());
                }
            }
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("raw", &self.raw).finish()
    }
}
