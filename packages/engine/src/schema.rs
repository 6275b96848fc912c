use std::path::Path;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ReplicantError;

/// One entry of a validation failure report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Pointer to the offending node in the candidate value.
    pub path: String,
    /// Pointer to the violated keyword in the schema.
    pub schema_path: String,
    pub message: String,
    /// The offending value itself.
    pub value: JsonValue,
}

/// A schema compiled once at declare time, reused for every mutation gate.
pub struct ReplicantSchema {
    raw: JsonValue,
    sum: String,
    compiled: JSONSchema,
}

impl std::fmt::Debug for ReplicantSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicantSchema")
            .field("sum", &self.sum)
            .finish_non_exhaustive()
    }
}

impl ReplicantSchema {
    pub fn compile(raw: JsonValue) -> Result<Self, ReplicantError> {
        let sum = schema_sum(&raw);
        let compiled = JSONSchema::options()
            .compile(&raw)
            .map_err(|err| ReplicantError::invalid_declaration(format!(
                "failed to compile schema: {err}"
            )))?;
        Ok(Self { raw, sum, compiled })
    }

    pub fn load(path: &Path) -> Result<Self, ReplicantError> {
        let raw_text = std::fs::read_to_string(path).map_err(|err| {
            ReplicantError::invalid_declaration(format!(
                "failed to read schema at {}: {err}",
                path.display()
            ))
        })?;
        let raw: JsonValue = serde_json::from_str(&raw_text).map_err(|err| {
            ReplicantError::invalid_declaration(format!(
                "schema at {} is not valid JSON: {err}",
                path.display()
            ))
        })?;
        Self::compile(raw)
    }

    pub fn raw(&self) -> &JsonValue {
        &self.raw
    }

    pub fn sum(&self) -> &str {
        &self.sum
    }

    /// Greedy validation: every violated keyword is reported, not only the
    /// first one.
    pub fn check(&self, candidate: &JsonValue) -> Vec<ValidationIssue> {
        match self.compiled.validate(candidate) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| ValidationIssue {
                    path: error.instance_path.to_string(),
                    schema_path: error.schema_path.to_string(),
                    message: error.to_string(),
                    value: error.instance.clone().into_owned(),
                })
                .collect(),
        }
    }
}

/// Content hash used for cross-process schema agreement. Hashing the compact
/// serialization keeps the sum independent of on-disk formatting.
pub fn schema_sum(schema: &JsonValue) -> String {
    let compact = serde_json::to_string(schema).unwrap_or_default();
    blake3::hash(compact.as_bytes()).to_hex().to_string()
}

pub(crate) fn format_issues(issues: &[ValidationIssue]) -> String {
    let mut parts = Vec::new();
    for issue in issues {
        if issue.path.is_empty() {
            parts.push(issue.message.clone());
        } else {
            parts.push(format!("{} {}", issue.path, issue.message));
        }
    }
    if parts.is_empty() {
        "unknown validation error".to_string()
    } else {
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter_schema() -> ReplicantSchema {
        ReplicantSchema::compile(json!({
            "type": "object",
            "properties": {
                "count": {"type": "number"},
                "label": {"type": "string"}
            },
            "required": ["count"],
            "additionalProperties": false
        }))
        .unwrap()
    }

    #[test]
    fn check_reports_every_violation() {
        let schema = counter_schema();
        let issues = schema.check(&json!({"count": "oops", "extra": true}));
        assert!(issues.len() >= 2);
        assert!(issues.iter().any(|issue| issue.path == "/count"));
        assert!(issues
            .iter()
            .any(|issue| issue.value == json!("oops")));
    }

    #[test]
    fn check_passes_conforming_values() {
        let schema = counter_schema();
        assert!(schema.check(&json!({"count": 3})).is_empty());
    }

    #[test]
    fn sum_ignores_formatting_but_not_content() {
        let a: JsonValue = serde_json::from_str("{\"type\": \"object\"}").unwrap();
        let b: JsonValue = serde_json::from_str("{ \"type\" : \"object\" }").unwrap();
        assert_eq!(schema_sum(&a), schema_sum(&b));
        assert_ne!(schema_sum(&a), schema_sum(&json!({"type": "array"})));
    }

    #[test]
    fn compile_rejects_malformed_schemas() {
        assert!(ReplicantSchema::compile(json!({"type": 17})).is_err());
    }
}
