//! `--to-cluster-params` handling.
//!
//! Overrides arrive as `key=value` strings and/or a YAML or JSON file. Raw
//! values are kept until they meet the template, where each one is checked
//! against the declared parameter and coerced to its type.

use aioclone_common::{Error, Result};
use aioclone_template::{ParameterType, Template};
use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;

/// Parameter values supplied by the caller for the target cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterOverrides {
    values: IndexMap<String, Value>,
}

impl ParameterOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` pairs. Values stay strings until [`Self::resolve`].
    pub fn from_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Self> {
        let mut overrides = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::Validation(format!(
                    "Malformed cluster parameter '{}'. Expected key=value.",
                    pair
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Validation(format!(
                    "Malformed cluster parameter '{}'. The key is empty.",
                    pair
                )));
            }
            overrides.set(key, Value::String(value.to_string()));
        }
        Ok(overrides)
    }

    /// Load a YAML or JSON mapping of parameter names to values.
    ///
    /// An ARM parameters file (`{"parameters": {"k": {"value": v}}}`) is
    /// accepted as well.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_document(&content).map_err(|e| match e {
            Error::Validation(msg) => {
                Error::Validation(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    /// Parse the text of a parameters file.
    pub fn from_document(content: &str) -> Result<Self> {
        let document: Value = serde_yaml::from_str(content).map_err(|e| {
            Error::Validation(format!("Cluster parameters file is not valid YAML or JSON: {}", e))
        })?;
        let map = match document {
            Value::Object(map) => map,
            Value::Null => return Ok(Self::new()),
            _ => {
                return Err(Error::Validation(
                    "Cluster parameters file must contain a mapping of names to values."
                        .to_string(),
                ))
            }
        };

        let arm_shaped = match map.get("parameters") {
            Some(Value::Object(params)) => Some(params.clone()),
            _ => None,
        };
        let mut overrides = Self::new();
        match arm_shaped {
            Some(params) => {
                for (key, entry) in params {
                    let value = entry.get("value").cloned().unwrap_or(entry);
                    overrides.set(key, value);
                }
            }
            None => {
                for (key, value) in map {
                    overrides.set(key, value);
                }
            }
        }
        Ok(overrides)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Layer `other` on top of `self`; keys in `other` win.
    pub fn merge(mut self, other: ParameterOverrides) -> Self {
        for (key, value) in other.values {
            self.values.insert(key, value);
        }
        self
    }

    /// Check every key against the template's parameters and coerce each
    /// value to the declared type.
    pub fn resolve(&self, template: &Template) -> Result<IndexMap<String, Value>> {
        let mut resolved = IndexMap::new();
        for (key, value) in &self.values {
            let def = template.parameters.get(key).ok_or_else(|| {
                let valid: Vec<&str> = template.parameters.keys().map(String::as_str).collect();
                Error::Validation(format!(
                    "Unknown parameter '{}' in --to-cluster-params. Valid parameters are: {}.",
                    key,
                    valid.join(", ")
                ))
            })?;
            resolved.insert(key.clone(), coerce(key, value, def.param_type)?);
        }
        Ok(resolved)
    }
}

/// Convert a raw value to `param_type`. Strings from `key=value` pairs are
/// parsed; values that already have the right JSON type pass through.
fn coerce(key: &str, value: &Value, param_type: ParameterType) -> Result<Value> {
    let mismatch = || {
        Error::Validation(format!(
            "Value {} for parameter '{}' is not a valid {}.",
            value,
            key,
            type_name(param_type)
        ))
    };

    match (param_type, value) {
        (ParameterType::String, Value::String(_)) => Ok(value.clone()),
        (ParameterType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (ParameterType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
        (ParameterType::Bool, Value::Bool(_)) => Ok(value.clone()),
        (ParameterType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(mismatch()),
        },
        (ParameterType::Int, Value::Number(n)) if n.is_i64() => Ok(value.clone()),
        (ParameterType::Int, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| mismatch()),
        (ParameterType::Object, Value::Object(_)) => Ok(value.clone()),
        (ParameterType::Object, Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ Value::Object(_)) => Ok(parsed),
            _ => Err(mismatch()),
        },
        _ => Err(mismatch()),
    }
}

fn type_name(param_type: ParameterType) -> &'static str {
    match param_type {
        ParameterType::String => "string",
        ParameterType::Bool => "bool",
        ParameterType::Int => "int",
        ParameterType::Object => "object",
    }
}
