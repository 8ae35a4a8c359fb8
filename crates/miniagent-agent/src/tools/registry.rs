//! Tool registry.
//!
//! Maps tool names to [`Tool`] implementations and their compiled input
//! validators.  Registration order is preserved so the tool list the model
//! sees is stable.  The registry is built before the engine starts and then
//! shared immutably behind an `Arc`; cloning it is cheap (every entry is
//! reference-counted).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::validation::InputValidator;
use super::Tool;
use crate::provider::ToolDefinition;

/// A registered tool and its compiled schema.
#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub validator: Arc<InputValidator>,
}

/// Name-indexed collection of tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    entries: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Add `tool`, replacing any tool already registered under its name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let validator = Arc::new(InputValidator::compile(&tool.input_schema()));
        if !validator.is_usable() {
            warn!(tool = %name, "tool input schema does not compile; calls will be rejected");
        }
        let entry = RegisteredTool { tool, validator };
        match self.index.get(&name) {
            Some(&i) => {
                warn!(tool = %name, "replacing previously registered tool");
                self.entries[i] = entry;
            }
            None => {
                self.index.insert(name, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.tool.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Definitions to send to the model, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries
            .iter()
            .map(|e| ToolDefinition {
                name: e.tool.name().to_string(),
                description: e.tool.description().to_string(),
                input_schema: e.tool.input_schema(),
            })
            .collect()
    }

    /// A registry holding only the named tools.  Unknown names are ignored.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let mut out = Self::new();
        for entry in &self.entries {
            let name = entry.tool.name();
            if names.iter().any(|n| n.as_ref() == name) {
                out.index.insert(name.to_string(), out.entries.len());
                out.entries.push(entry.clone());
            }
        }
        out
    }

    /// A registry without the named tool.
    pub fn without(&self, name: &str) -> Self {
        let keep: Vec<String> = self.names().into_iter().filter(|n| n != name).collect();
        self.subset(&keep)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FunctionTool;
    use serde_json::json;

    fn tool(name: &str) -> FunctionTool {
        FunctionTool::new(name, format!("{name} tool"), json!({"type": "object"}), |_| async {
            Ok(json!(null))
        })
    }

    #[test]
    fn preserves_registration_order() {
        let registry = ToolRegistry::new()
            .with_tool(tool("b"))
            .with_tool(tool("a"))
            .with_tool(tool("c"));
        assert_eq!(registry.names(), vec!["b", "a", "c"]);
        let defs = registry.definitions();
        assert_eq!(defs[1].name, "a");
        assert_eq!(defs[1].description, "a tool");
    }

    #[test]
    fn re_registering_replaces_in_place() {
        let mut registry = ToolRegistry::new().with_tool(tool("x")).with_tool(tool("y"));
        registry.register(FunctionTool::new("x", "replacement", json!({}), |_| async {
            Ok(json!(1))
        }));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["x", "y"]);
        assert_eq!(registry.get("x").unwrap().tool.description(), "replacement");
    }

    #[test]
    fn subset_filters_and_ignores_unknown() {
        let registry = ToolRegistry::new()
            .with_tool(tool("read"))
            .with_tool(tool("write"))
            .with_tool(tool("exec"));
        let sub = registry.subset(&["exec", "read", "missing"]);
        assert_eq!(sub.names(), vec!["read", "exec"]);
        assert!(!sub.contains("write"));
        assert!(registry.without("write").get("write").is_none());
    }
}
