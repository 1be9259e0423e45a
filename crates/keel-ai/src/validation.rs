use std::sync::Arc;

use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{KeelAiError, KeelAiErrorCode};
use crate::types::{ToolCall, ToolSpec};

/// One schema violation, addressed by JSON pointer into the call arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgumentViolation {
    pub pointer: String,
    pub reason: String,
}

/// A tool's parameter schema, compiled once when the tool is registered.
#[derive(Clone)]
pub struct ArgumentValidator {
    tool: String,
    schema: Arc<JSONSchema>,
}

impl ArgumentValidator {
    pub fn compile(spec: &ToolSpec) -> Result<Self, KeelAiError> {
        let schema = JSONSchema::compile(&spec.parameters).map_err(|error| {
            KeelAiError::new(
                KeelAiErrorCode::SchemaInvalid,
                format!("tool '{}' has an invalid parameter schema: {error}", spec.name),
            )
            .with_details(json!({ "tool": spec.name }))
        })?;
        Ok(Self {
            tool: spec.name.clone(),
            schema: Arc::new(schema),
        })
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Every violation in `args`, empty when they conform.
    pub fn violations(&self, args: &Value) -> Vec<ArgumentViolation> {
        let Err(errors) = self.schema.validate(args) else {
            return Vec::new();
        };
        errors
            .map(|error| {
                let pointer = error.instance_path.to_string();
                ArgumentViolation {
                    pointer: if pointer.is_empty() { "/".to_string() } else { pointer },
                    reason: error.to_string(),
                }
            })
            .collect()
    }

    /// The error message lists every violation so the model can correct the
    /// call on its next turn.
    pub fn check(&self, call: &ToolCall) -> Result<(), KeelAiError> {
        let violations = self.violations(&call.args);
        if violations.is_empty() {
            return Ok(());
        }
        let listed = violations
            .iter()
            .map(|violation| format!("{} {}", violation.pointer, violation.reason))
            .collect::<Vec<_>>()
            .join("; ");
        Err(KeelAiError::new(
            KeelAiErrorCode::ToolArgumentsInvalid,
            format!("invalid arguments for '{}': {listed}", self.tool),
        )
        .with_details(json!({
            "tool": self.tool,
            "callId": call.id,
            "violations": violations,
        })))
    }
}

impl std::fmt::Debug for ArgumentValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgumentValidator")
            .field("tool", &self.tool)
            .finish_non_exhaustive()
    }
}
