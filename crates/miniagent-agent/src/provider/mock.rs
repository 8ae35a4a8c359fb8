//! Scripted model provider.
//!
//! [`ScriptedProvider`] replays a queue of [`ScriptedTurn`]s, one per
//! [`ModelProvider::send`] call, and records every request it receives.
//! It makes engine behaviour fully deterministic, which is what the test
//! suites rely on, and doubles as an offline stand-in for a real backend.
//!
//! ```rust
//! # use miniagent_agent::provider::{ScriptedProvider, ScriptedTurn};
//! # use serde_json::json;
//! let provider = ScriptedProvider::new("scripted")
//!     .push(ScriptedTurn::tool_call("call_1", "exec", json!({"command": "ls"})))
//!     .push(ScriptedTurn::text("There are two files."));
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use miniagent_kernel::ToolCall;
use serde_json::Value;

use super::{ChatRequest, ModelProvider, ResponseFragment, ResponseStream};
use crate::error::ProviderError;

// ---------------------------------------------------------------------------
// Scripted turn
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Step {
    Fragment(ResponseFragment),
    Pause(Duration),
    Fail(ProviderError),
}

/// One scripted model response.
///
/// The stream ends with [`ResponseFragment::Done`] unless a mid-stream
/// failure was scripted with [`ScriptedTurn::then_fail`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    steps: Vec<Step>,
    send_error: Option<ProviderError>,
    delay: Option<Duration>,
}

impl ScriptedTurn {
    pub fn new() -> Self {
        Self::default()
    }

    /// A plain text answer.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new().with_text(text)
    }

    /// A response that requests a single tool call.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::new().with_tool_call(id, name, input)
    }

    /// A response whose `send` fails before any fragment is produced.
    pub fn fail_send(error: ProviderError) -> Self {
        Self {
            send_error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.steps
            .push(Step::Fragment(ResponseFragment::TextDelta(text.into())));
        self
    }

    pub fn with_tool_call(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
    ) -> Self {
        self.steps
            .push(Step::Fragment(ResponseFragment::ToolCall(ToolCall::new(id, name, input))));
        self
    }

    pub fn with_fragment(mut self, fragment: ResponseFragment) -> Self {
        self.steps.push(Step::Fragment(fragment));
        self
    }

    /// Pause inside the stream before the next fragment.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.steps.push(Step::Pause(pause));
        self
    }

    /// Wait this long inside `send` before returning the stream.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// End the stream with `error` after the fragments scripted so far.
    pub fn then_fail(mut self, error: ProviderError) -> Self {
        self.steps.push(Step::Fail(error));
        self
    }

    fn into_stream(self) -> ResponseStream {
        let mut steps = self.steps;
        if !steps.iter().any(|s| matches!(s, Step::Fail(_))) {
            steps.push(Step::Fragment(ResponseFragment::Done));
        }
        futures::stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    Step::Pause(pause) => tokio::time::sleep(pause).await,
                    Step::Fragment(fragment) => return Some((Ok(fragment), steps)),
                    Step::Fail(error) => return Some((Err(error), Vec::new().into_iter())),
                }
            }
        })
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// A [`ModelProvider`] that replays scripted turns in order.
///
/// Once the queue is empty the fallback turn (if any) is replayed forever;
/// without a fallback, `send` fails with
/// [`ProviderError::InvalidResponse`].
#[derive(Debug)]
pub struct ScriptedProvider {
    model: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    fallback: Option<ScriptedTurn>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            turns: Mutex::new(VecDeque::new()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a turn.
    pub fn push(self, turn: ScriptedTurn) -> Self {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
        self
    }

    /// Turn to replay once the queue is exhausted.
    pub fn with_fallback(mut self, turn: ScriptedTurn) -> Self {
        self.fallback = Some(turn);
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of scripted turns not yet consumed.
    pub fn remaining(&self) -> usize {
        self.turns.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        let queued = self.turns.lock().ok().and_then(|mut t| t.pop_front());
        queued.or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &ChatRequest) -> Result<ResponseStream, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let Some(turn) = self.next_turn() else {
            return Err(ProviderError::InvalidResponse {
                reason: "script exhausted".into(),
            });
        };
        if let Some(delay) = turn.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = turn.send_error {
            return Err(error);
        }
        Ok(turn.into_stream())
    }
}
