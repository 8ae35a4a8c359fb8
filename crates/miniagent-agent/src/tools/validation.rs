//! Tool input validation against JSON Schema (draft 7).

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

/// A tool's compiled input schema.
///
/// Compilation happens once, at registration.  A schema that fails to compile
/// is remembered as an error and every call to that tool is rejected as a
/// validation failure instead of being executed unchecked.
pub struct InputValidator {
    compiled: Result<JSONSchema, String>,
}

impl InputValidator {
    pub fn compile(schema: &Value) -> Self {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| format!("tool schema does not compile: {e}"));
        Self { compiled }
    }

    /// Whether the schema compiled.
    pub fn is_usable(&self) -> bool {
        self.compiled.is_ok()
    }

    /// Check `input`, returning every violation joined into one message.
    pub fn validate(&self, input: &Value) -> Result<(), String> {
        let schema = self.compiled.as_ref().map_err(Clone::clone)?;
        if let Err(errors) = schema.validate(input) {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect();
            return Err(messages.join("; "));
        }
        Ok(())
    }
}

impl std::fmt::Debug for InputValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputValidator")
            .field("usable", &self.is_usable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exec_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "command": { "type": "string" } },
            "required": ["command"]
        })
    }

    #[test]
    fn accepts_conforming_input() {
        let v = InputValidator::compile(&exec_schema());
        assert!(v.is_usable());
        assert!(v.validate(&json!({"command": "ls"})).is_ok());
    }

    #[test]
    fn reports_missing_required_field() {
        let v = InputValidator::compile(&exec_schema());
        let err = v.validate(&json!({})).unwrap_err();
        assert!(err.contains("command"), "unexpected message: {err}");
    }

    #[test]
    fn reports_wrong_type_with_path() {
        let v = InputValidator::compile(&exec_schema());
        let err = v.validate(&json!({"command": 42})).unwrap_err();
        assert!(err.starts_with("/command"), "unexpected message: {err}");
    }

    #[test]
    fn broken_schema_rejects_everything() {
        let v = InputValidator::compile(&json!({"type": 12}));
        assert!(!v.is_usable());
        assert!(v.validate(&json!({})).is_err());
    }
}
