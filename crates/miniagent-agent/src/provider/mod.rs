//! Model provider abstraction.
//!
//! The engine never talks to a model API directly.  It hands a
//! [`ChatRequest`] to a [`ModelProvider`] and consumes the returned stream of
//! [`ResponseFragment`]s.  Text fragments are forwarded to observers as they
//! arrive; tool calls are collected by a [`StreamAccumulator`] into the
//! [`ModelTurn`] the turn loop acts on.
//!
//! ## Modules
//!
//! - [`retry`] -- Exponential backoff policy for retryable provider failures.
//! - [`mock`] -- A scripted provider for tests and offline runs.

pub mod mock;
pub mod retry;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use miniagent_kernel::{Message, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

pub use mock::{ScriptedProvider, ScriptedTurn};
pub use retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A tool definition exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's input.
    pub input_schema: Value,
}

/// Everything the provider needs for one model call.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// The model identifier.
    pub model: String,

    /// Standing instructions, sent separately from the history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// The conversation so far.
    pub messages: Vec<Message>,

    /// Tools the model may invoke.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

// ---------------------------------------------------------------------------
// Response stream
// ---------------------------------------------------------------------------

/// One item of a streamed model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFragment {
    /// Incremental assistant text.
    TextDelta(String),

    /// A complete tool call.
    ToolCall(ToolCall),

    /// A tool call whose input will arrive as JSON fragments.
    ToolCallStart { id: String, name: String },

    /// A piece of the JSON input of a tool call opened by
    /// [`ResponseFragment::ToolCallStart`].
    ToolInputDelta { id: String, partial_json: String },

    /// The response is complete.  Anything after this is ignored.
    Done,
}

/// Boxed fragment stream returned by [`ModelProvider::send`].
pub type ResponseStream = BoxStream<'static, Result<ResponseFragment, ProviderError>>;

/// A language-model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Default model identifier, used when the engine config names none.
    fn model(&self) -> &str;

    /// Start one model call.  Errors before the first fragment are reported
    /// here; errors mid-stream are stream items.
    async fn send(&self, request: &ChatRequest) -> Result<ResponseStream, ProviderError>;
}

// ---------------------------------------------------------------------------
// Stream accumulator
// ---------------------------------------------------------------------------

/// What the model produced in one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    pub text: String,
    /// Tool calls in emission order.
    pub tool_calls: Vec<ToolCall>,
}

impl ModelTurn {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Folds [`ResponseFragment`]s into a [`ModelTurn`].
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    /// Completed calls and placeholders for streamed ones, in order.
    slots: Vec<Slot>,
    /// Streamed call id -> index into `slots`.
    open: HashMap<String, usize>,
    done: bool,
}

#[derive(Debug)]
enum Slot {
    Complete(ToolCall),
    Streaming {
        id: String,
        name: String,
        json: String,
    },
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fragment.  Returns the text delta to forward, if any.
    pub fn apply(&mut self, fragment: ResponseFragment) -> Result<Option<String>, ProviderError> {
        if self.done {
            return Ok(None);
        }
        match fragment {
            ResponseFragment::TextDelta(delta) => {
                if delta.is_empty() {
                    return Ok(None);
                }
                self.text.push_str(&delta);
                Ok(Some(delta))
            }
            ResponseFragment::ToolCall(call) => {
                self.slots.push(Slot::Complete(call));
                Ok(None)
            }
            ResponseFragment::ToolCallStart { id, name } => {
                self.open.insert(id.clone(), self.slots.len());
                self.slots.push(Slot::Streaming {
                    id,
                    name,
                    json: String::new(),
                });
                Ok(None)
            }
            ResponseFragment::ToolInputDelta { id, partial_json } => {
                let Some(&index) = self.open.get(&id) else {
                    return Err(ProviderError::InvalidResponse {
                        reason: format!("input delta for unknown tool call `{id}`"),
                    });
                };
                if let Some(Slot::Streaming { json, .. }) = self.slots.get_mut(index) {
                    json.push_str(&partial_json);
                }
                Ok(None)
            }
            ResponseFragment::Done => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Whether a [`ResponseFragment::Done`] has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Finish the turn, parsing streamed tool inputs.
    pub fn into_turn(self) -> Result<ModelTurn, ProviderError> {
        let mut tool_calls = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            match slot {
                Slot::Complete(call) => tool_calls.push(call),
                Slot::Streaming { id, name, json } => {
                    let input = if json.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&json).map_err(|e| {
                            ProviderError::InvalidResponse {
                                reason: format!("tool call `{id}` has malformed input: {e}"),
                            }
                        })?
                    };
                    tool_calls.push(ToolCall { id, name, input });
                }
            }
        }
        Ok(ModelTurn {
            text: self.text,
            tool_calls,
        })
    }
}
