//! Payload validation against manifest input declarations
//!
//! Every violation is collected so callers can report them all at once.

use crate::manifest::{AlgorithmManifest, IoSpec, ValidationRule};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A single reason a payload was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Offending field
    pub field: String,
    /// Human readable reason
    pub message: String,
}

impl Violation {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate `payload` against the manifest's inputs
///
/// The payload must be a JSON object. Optional inputs that are absent are
/// accepted; unknown keys are passed through untouched.
pub fn validate_payload(
    manifest: &AlgorithmManifest,
    payload: &Value,
) -> Result<(), Vec<Violation>> {
    let Some(fields) = payload.as_object() else {
        return Err(vec![Violation::new("$", "payload must be a JSON object")]);
    };

    let mut violations = Vec::new();
    for spec in &manifest.inputs {
        check_field(spec, fields, &mut violations);
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn check_field(spec: &IoSpec, fields: &Map<String, Value>, out: &mut Vec<Violation>) {
    let value = match fields.get(&spec.name) {
        None | Some(Value::Null) if spec.required => {
            out.push(Violation::new(&spec.name, "required field is missing"));
            return;
        }
        None | Some(Value::Null) => return,
        Some(value) => value,
    };

    if !spec.data_type.accepts(value) {
        out.push(Violation::new(
            &spec.name,
            format!("expected {}, got {}", spec.data_type, json_kind(value)),
        ));
        // Rules assume the declared type
        return;
    }

    for rule in &spec.validation {
        if let Some(message) = check_rule(rule, value) {
            out.push(Violation::new(&spec.name, message));
        }
    }
}

fn check_rule(rule: &ValidationRule, value: &Value) -> Option<String> {
    match rule {
        ValidationRule::Min { value: min } => value
            .as_f64()
            .filter(|v| v < min)
            .map(|v| format!("{v} is below minimum {min}")),
        ValidationRule::Max { value: max } => value
            .as_f64()
            .filter(|v| v > max)
            .map(|v| format!("{v} is above maximum {max}")),
        ValidationRule::Pattern { value: pattern } => {
            let text = value.as_str()?;
            match regex::Regex::new(pattern) {
                Ok(re) if re.is_match(text) => None,
                Ok(_) => Some(format!("{text:?} does not match pattern {pattern:?}")),
                Err(e) => Some(format!("invalid pattern {pattern:?}: {e}")),
            }
        }
        ValidationRule::Length { min, max } => {
            let len = match value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                _ => return None,
            };
            if min.is_some_and(|min| len < min) || max.is_some_and(|max| len > max) {
                Some(format!(
                    "length {len} outside [{}, {}]",
                    min.map_or_else(|| "0".to_string(), |m| m.to_string()),
                    max.map_or_else(|| "inf".to_string(), |m| m.to_string()),
                ))
            } else {
                None
            }
        }
        ValidationRule::Enum { values } => {
            if values.iter().any(|allowed| same_value(allowed, value)) {
                None
            } else {
                Some(format!("{value} is not one of the allowed values"))
            }
        }
    }
}

/// Equality that treats `1` and `1.0` as the same number
fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
