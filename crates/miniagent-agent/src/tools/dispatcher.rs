//! Tool dispatch pipeline.
//!
//! `lookup -> validate -> execute (with timeout) -> result`.  Every stage
//! that fails produces a [`ToolResult`] instead of an error, so one bad tool
//! call never aborts the run: the model sees the failure and decides what to
//! do next.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use miniagent_kernel::{ToolCall, ToolResult, text};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ToolContext, ToolRegistry};
use crate::error::ToolError;

/// Default per-call execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Executes tool calls against a shared registry.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `call` and fold any failure into the returned result.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        match self.execute(call, ctx).await {
            Ok(content) => ToolResult::success(&call.id, content),
            Err(err) => to_result(&call.id, &err),
        }
    }

    /// Run `call`, reporting failures as [`ToolError`].
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<Value, ToolError> {
        let Some(entry) = self.registry.get(&call.name) else {
            debug!(tool = %call.name, call_id = %call.id, "unknown tool requested");
            return Err(ToolError::UnknownTool {
                tool_name: call.name.clone(),
            });
        };

        // Models sometimes omit the input entirely for argument-less tools.
        let input = match &call.input {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        entry
            .validator
            .validate(&input)
            .map_err(|reason| ToolError::Validation {
                tool_name: call.name.clone(),
                reason,
            })?;

        let started = Instant::now();
        let body = AssertUnwindSafe(entry.tool.execute(input, ctx)).catch_unwind();
        let outcome = tokio::time::timeout(self.timeout, body).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Err(_) => {
                warn!(tool = %call.name, timeout = ?self.timeout, "tool execution timed out");
                Err(ToolError::Timeout {
                    tool_name: call.name.clone(),
                    timeout: self.timeout,
                })
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                warn!(tool = %call.name, %reason, "tool panicked");
                Err(ToolError::Execution {
                    tool_name: call.name.clone(),
                    reason: format!("tool panicked: {reason}"),
                })
            }
            Ok(Ok(Err(e))) => {
                debug!(tool = %call.name, elapsed_ms, error = %e, "tool returned an error");
                Err(ToolError::Execution {
                    tool_name: call.name.clone(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(Ok(value))) => {
                debug!(
                    tool = %call.name,
                    elapsed_ms,
                    preview = %text::preview(&value.to_string(), 120),
                    "tool completed"
                );
                Ok(value)
            }
        }
    }
}

/// Convert a dispatch failure into the result the model sees.
pub fn to_result(call_id: &str, err: &ToolError) -> ToolResult {
    if err.is_skip() {
        ToolResult::skipped(call_id, err.kind(), err.to_string())
    } else {
        ToolResult::failed(call_id, err.kind(), err.to_string())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FunctionTool;
    use miniagent_kernel::{EventBus, ToolFailureKind};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx() -> ToolContext {
        ToolContext {
            run_id: Uuid::now_v7(),
            session_key: "test".into(),
            call_id: "c1".into(),
            events: EventBus::new(),
            cancel: CancellationToken::new(),
        }
    }

    async fn explode(_input: Value) -> crate::tools::ToolOutput {
        panic!("kaboom")
    }

    fn dispatcher(timeout: Duration) -> ToolDispatcher {
        let registry = ToolRegistry::new()
            .with_tool(FunctionTool::new(
                "echo",
                "Echo text",
                json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
                |input| async move { Ok(input["text"].clone()) },
            ))
            .with_tool(FunctionTool::new("fail", "Always fails", json!({}), |_| async {
                Err("disk on fire".into())
            }))
            .with_tool(FunctionTool::new("slow", "Sleeps", json!({}), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("late"))
            }))
            .with_tool(FunctionTool::new("panic", "Panics", json!({}), explode));
        ToolDispatcher::new(Arc::new(registry), timeout)
    }

    #[tokio::test]
    async fn successful_call_returns_content() {
        let d = dispatcher(DEFAULT_TOOL_TIMEOUT);
        let result = d
            .dispatch(&ToolCall::new("c1", "echo", json!({"text": "hi"})), &ctx())
            .await;
        assert_eq!(result.content, json!("hi"));
        assert!(!result.is_error());
        assert!(!result.skipped);
    }

    #[tokio::test]
    async fn unknown_tool_is_skipped() {
        let d = dispatcher(DEFAULT_TOOL_TIMEOUT);
        let result = d.dispatch(&ToolCall::new("c1", "nope", json!({})), &ctx()).await;
        assert!(result.skipped);
        assert_eq!(result.error.unwrap().kind, ToolFailureKind::UnknownTool);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_execution() {
        let d = dispatcher(DEFAULT_TOOL_TIMEOUT);
        let result = d
            .dispatch(&ToolCall::new("c1", "echo", json!({"text": 5})), &ctx())
            .await;
        assert!(!result.skipped);
        assert_eq!(result.error.unwrap().kind, ToolFailureKind::Validation);
    }

    #[tokio::test]
    async fn null_input_is_treated_as_empty_object() {
        let d = dispatcher(DEFAULT_TOOL_TIMEOUT);
        let result = d.dispatch(&ToolCall::new("c1", "echo", Value::Null), &ctx()).await;
        // Still fails validation because `text` is required, not because of the null.
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, ToolFailureKind::Validation);
        assert!(failure.message.contains("text"));
    }

    #[tokio::test]
    async fn returned_error_becomes_execution_failure() {
        let d = dispatcher(DEFAULT_TOOL_TIMEOUT);
        let result = d.dispatch(&ToolCall::new("c1", "fail", json!({})), &ctx()).await;
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, ToolFailureKind::Execution);
        assert!(failure.message.contains("disk on fire"));
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let d = dispatcher(Duration::from_millis(20));
        let result = d.dispatch(&ToolCall::new("c1", "slow", json!({})), &ctx()).await;
        assert_eq!(result.error.unwrap().kind, ToolFailureKind::Timeout);
    }

    #[tokio::test]
    async fn panic_is_captured() {
        let d = dispatcher(DEFAULT_TOOL_TIMEOUT);
        let result = d.dispatch(&ToolCall::new("c1", "panic", json!({})), &ctx()).await;
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, ToolFailureKind::Execution);
        assert!(failure.message.contains("kaboom"));
    }
}
