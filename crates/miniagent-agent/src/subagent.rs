//! Subagent delegation.
//!
//! A [`SubagentManager`] runs a delegated task as an independent child
//! [`Agent`]: its own in-memory session, its own event bus, a restricted tool
//! set and a smaller turn budget.  The parent only ever sees the outcome, as
//! a `subagent_summary` or `subagent_error` event on its own bus and as the
//! result of the `delegate` tool call that started it.  A failed child never
//! fails the parent run.

use std::sync::Arc;

use async_trait::async_trait;
use miniagent_kernel::{AgentEvent, EventBus, text};
use miniagent_store::MemorySessionStore;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::compaction::Summarizer;
use crate::error::SubagentError;
use crate::provider::ModelProvider;
use crate::runtime::{Agent, AgentConfig};
use crate::tools::{Tool, ToolContext, ToolOutput, ToolRegistry};

/// Limits applied to every child agent.
#[derive(Debug, Clone, PartialEq)]
pub struct SubagentConfig {
    pub max_turns: u32,
    pub max_tool_calls: u32,
    /// How many levels of delegation are allowed below the top-level agent.
    pub max_depth: u32,
    /// Tools the child may use; `None` means all of the parent's tools.
    pub allowed_tools: Option<Vec<String>>,
    /// Replaces the parent's system prompt in the child.
    pub system_prompt: Option<String>,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_turns: 15,
            max_tool_calls: 30,
            max_depth: 1,
            allowed_tools: None,
            system_prompt: None,
        }
    }
}

/// Where a child reports back to.
#[derive(Debug, Clone)]
pub struct ParentLink {
    pub events: EventBus,
    pub run_id: Uuid,
    /// The child's token is derived from this one.
    pub cancel: CancellationToken,
}

impl ParentLink {
    pub fn from_context(ctx: &ToolContext) -> Self {
        Self {
            events: ctx.events.clone(),
            run_id: ctx.run_id,
            cancel: ctx.cancel.clone(),
        }
    }
}

/// How a delegated task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SubagentOutcome {
    Completed {
        label: Option<String>,
        summary: String,
        turns: u32,
        tool_calls: u32,
    },
    Failed {
        label: Option<String>,
        error: String,
    },
}

impl SubagentOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Spawns child agents for delegated tasks.
pub struct SubagentManager {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    base: AgentConfig,
    summarizer: Arc<dyn Summarizer>,
    config: SubagentConfig,
    depth: u32,
}

impl SubagentManager {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        base: AgentConfig,
        summarizer: Arc<dyn Summarizer>,
        config: SubagentConfig,
        depth: u32,
    ) -> Self {
        Self {
            provider,
            tools,
            base,
            summarizer,
            config,
            depth,
        }
    }

    pub fn config(&self) -> &SubagentConfig {
        &self.config
    }

    /// Nesting level of the agent owning this manager (0 = top level).
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Tool names a child will be given.
    pub fn child_tool_names(&self) -> Vec<String> {
        self.child_tools().names()
    }

    /// Run `task` in a fresh child agent and report the outcome to `parent`.
    pub async fn delegate(
        &self,
        task: &str,
        label: Option<String>,
        parent: &ParentLink,
    ) -> SubagentOutcome {
        let child = self.build_child();
        let session_key = format!("subagent:{}", Uuid::now_v7());
        info!(
            parent_run = %parent.run_id,
            label = label.as_deref().unwrap_or("-"),
            depth = self.depth + 1,
            task = %text::preview(task, 80),
            "delegating to subagent"
        );

        match child
            .run_with_cancel(&session_key, task, parent.cancel.child_token())
            .await
        {
            Ok(summary) => {
                parent.events.publish(AgentEvent::SubagentSummary {
                    run_id: parent.run_id,
                    label: label.clone(),
                    summary: summary.text.clone(),
                });
                SubagentOutcome::Completed {
                    label,
                    summary: summary.text,
                    turns: summary.turns,
                    tool_calls: summary.tool_calls,
                }
            }
            Err(e) => {
                warn!(parent_run = %parent.run_id, error = %e, "subagent failed");
                parent.events.publish(AgentEvent::SubagentError {
                    run_id: parent.run_id,
                    label: label.clone(),
                    error: e.to_string(),
                });
                SubagentOutcome::Failed {
                    label,
                    error: e.to_string(),
                }
            }
        }
    }

    fn child_tools(&self) -> ToolRegistry {
        match &self.config.allowed_tools {
            Some(names) => self.tools.subset(names),
            None => (*self.tools).clone(),
        }
    }

    fn build_child(&self) -> Agent {
        let config = AgentConfig {
            system_prompt: self
                .config
                .system_prompt
                .clone()
                .or_else(|| self.base.system_prompt.clone()),
            max_turns: self.config.max_turns,
            max_tool_calls: Some(self.config.max_tool_calls),
            max_concurrent_calls: None,
            ..self.base.clone()
        };
        let mut builder = Agent::builder(Arc::clone(&self.provider))
            .tools(self.child_tools())
            .config(config)
            .store(Arc::new(MemorySessionStore::new()))
            .summarizer(Arc::clone(&self.summarizer))
            .depth(self.depth + 1);
        if self.depth + 1 < self.config.max_depth {
            builder = builder.subagents(self.config.clone());
        }
        builder.build()
    }
}

impl std::fmt::Debug for SubagentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentManager")
            .field("depth", &self.depth)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// The `delegate` tool
// ---------------------------------------------------------------------------

/// Exposes a [`SubagentManager`] to the model.
pub struct DelegateTool {
    manager: Arc<SubagentManager>,
}

impl DelegateTool {
    pub const NAME: &'static str = "delegate";

    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Delegate a self-contained task to a subagent with its own context. \
         Returns the subagent's final answer."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Complete instructions for the subagent"
                },
                "label": {
                    "type": "string",
                    "description": "Short name used when reporting the result"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutput {
        let task = input["task"].as_str().unwrap_or_default();
        let label = input["label"].as_str().map(str::to_string);
        let parent = ParentLink::from_context(ctx);

        match self.manager.delegate(task, label, &parent).await {
            SubagentOutcome::Completed { summary, .. } => Ok(Value::String(summary)),
            SubagentOutcome::Failed { label, error } => Err(SubagentError {
                label,
                reason: error,
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ScriptedProvider, ScriptedTurn};
    use crate::tools::FunctionTool;
    use std::sync::Mutex;

    fn manager(provider: ScriptedProvider, config: SubagentConfig) -> SubagentManager {
        let provider: Arc<dyn ModelProvider> = Arc::new(provider);
        let tools = ToolRegistry::new()
            .with_tool(FunctionTool::new("read", "Read", json!({}), |_| async {
                Ok(json!("contents"))
            }))
            .with_tool(FunctionTool::new("write", "Write", json!({}), |_| async {
                Ok(json!("ok"))
            }));
        let summarizer = Arc::new(crate::compaction::ProviderSummarizer::new(Arc::clone(
            &provider,
        )));
        SubagentManager::new(
            provider,
            Arc::new(tools),
            AgentConfig::default(),
            summarizer,
            config,
            0,
        )
    }

    fn parent() -> (ParentLink, Arc<Mutex<Vec<AgentEvent>>>) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        let link = ParentLink {
            events: bus,
            run_id: Uuid::now_v7(),
            cancel: CancellationToken::new(),
        };
        (link, seen)
    }

    #[tokio::test]
    async fn completed_child_reports_summary_to_parent() {
        let m = manager(
            ScriptedProvider::new("scripted").push(ScriptedTurn::text("found 3 files")),
            SubagentConfig::default(),
        );
        let (link, seen) = parent();

        let outcome = m.delegate("count files", Some("scan".into()), &link).await;
        assert_eq!(
            outcome,
            SubagentOutcome::Completed {
                label: Some("scan".into()),
                summary: "found 3 files".into(),
                turns: 1,
                tool_calls: 0,
            }
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            AgentEvent::SubagentSummary { run_id, summary, .. }
                if *run_id == link.run_id && summary == "found 3 files"
        ));
    }

    #[tokio::test]
    async fn failed_child_reports_error_to_parent() {
        let m = manager(ScriptedProvider::new("scripted"), SubagentConfig::default());
        let (link, seen) = parent();

        let outcome = m.delegate("anything", None, &link).await;
        assert!(!outcome.is_completed());
        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [AgentEvent::SubagentError { label: None, .. }]
        ));
    }

    #[test]
    fn allowed_tools_restrict_the_child() {
        let m = manager(
            ScriptedProvider::new("scripted"),
            SubagentConfig {
                allowed_tools: Some(vec!["read".into()]),
                ..SubagentConfig::default()
            },
        );
        assert_eq!(m.child_tool_names(), vec!["read"]);
    }

    #[tokio::test]
    async fn children_at_max_depth_cannot_delegate() {
        let provider = ScriptedProvider::new("scripted")
            .push(ScriptedTurn::tool_call("c1", "delegate", json!({"task": "deeper"})))
            .push(ScriptedTurn::text("could not delegate"));
        let m = manager(provider, SubagentConfig::default());
        let (link, _seen) = parent();

        // The child has no `delegate` tool, so its call is skipped as unknown.
        let outcome = m.delegate("try to nest", None, &link).await;
        assert!(matches!(
            outcome,
            SubagentOutcome::Completed { turns: 2, tool_calls: 0, .. }
        ));
    }
}
