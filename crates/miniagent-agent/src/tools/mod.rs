//! Tools the model can invoke.
//!
//! A [`Tool`] declares a name, a description and a JSON Schema for its
//! input, and executes asynchronously.  Tools are collected in a
//! [`ToolRegistry`] that is shared read-only across runs; the
//! [`ToolDispatcher`] turns each model-issued [`ToolCall`] into exactly one
//! [`ToolResult`], whatever happens inside the tool.
//!
//! [`ToolCall`]: miniagent_kernel::ToolCall
//! [`ToolResult`]: miniagent_kernel::ToolResult

pub mod dispatcher;
pub mod registry;
pub mod validation;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use miniagent_kernel::EventBus;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use dispatcher::ToolDispatcher;
pub use registry::ToolRegistry;
pub use validation::InputValidator;

/// Error type tool bodies return; any error converts into it with `?`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The value a tool body resolves to.
pub type ToolOutput = Result<Value, BoxError>;

/// Per-call context handed to [`Tool::execute`].
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The run issuing the call.
    pub run_id: Uuid,
    pub session_key: String,
    /// The model-assigned call id.
    pub call_id: String,
    /// The bus of the agent running the call.
    pub events: EventBus,
    /// Cancelled when the run is cancelled; long-running tools should watch it.
    pub cancel: CancellationToken,
}

/// A named capability the model may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model uses to call this tool.
    fn name(&self) -> &str;

    /// What the tool does, shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema (draft 7) the input must satisfy.
    fn input_schema(&self) -> Value;

    /// Run the tool.  Returned errors become error results for the model.
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutput;
}

// ---------------------------------------------------------------------------
// Closure-backed tools
// ---------------------------------------------------------------------------

type BoxedHandler =
    Box<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ToolOutput> + Send>> + Send + Sync>;

/// A [`Tool`] built from an async closure.
///
/// ```rust
/// # use miniagent_agent::tools::FunctionTool;
/// # use serde_json::json;
/// let echo = FunctionTool::new(
///     "echo",
///     "Echo the input back",
///     json!({"type": "object", "properties": {"text": {"type": "string"}}}),
///     |input| async move { Ok(input["text"].clone()) },
/// );
/// ```
pub struct FunctionTool {
    name: String,
    description: String,
    schema: Value,
    handler: BoxedHandler,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolOutput> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler: Box::new(move |input| Box::pin(handler(input))),
        }
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolOutput {
        (self.handler)(input).await
    }
}
