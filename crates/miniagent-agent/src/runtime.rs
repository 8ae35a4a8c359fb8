//! The agent turn loop.
//!
//! An [`Agent`] owns a model provider, a session store, a tool registry and
//! an event bus.  [`Agent::run`] drives one user utterance to completion:
//!
//! ```text
//! load history ─> append user ─> agent_start
//!    ┌──────────────────────────────────────────────┐
//!    │ compact if over budget                        │
//!    │ model call (streamed: message_delta*, end)    │
//!    │ no tool calls? ──> append assistant, finish   │
//!    │ per call: start ─> dispatch ─> end | skipped  │
//!    │ append assistant + one tool message           │
//!    └──────────────── repeat up to max_turns ──────┘
//! compact ─> persist ─> agent_end
//! ```
//!
//! A turn's assistant and tool messages are committed together once every
//! call has a result, so a failed or cancelled run persists only complete
//! turns.  At most one run is active per session key; runs on different keys
//! proceed in parallel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use miniagent_kernel::{AgentEvent, EventBus, Message, Subscription, ToolCall, ToolResult, text};
use miniagent_store::{MemorySessionStore, SessionStore};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compaction::{Compacted, CompactionConfig, Compactor, ProviderSummarizer, Summarizer};
use crate::error::{AgentError, ProviderError, Result, ToolError};
use crate::provider::{ChatRequest, ModelProvider, ModelTurn, RetryPolicy, StreamAccumulator};
use crate::subagent::{DelegateTool, SubagentConfig, SubagentManager};
use crate::tools::dispatcher::{DEFAULT_TOOL_TIMEOUT, to_result};
use crate::tools::{ToolContext, ToolDispatcher, ToolRegistry};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration for an [`Agent`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Model identifier; `None` uses the provider's default.
    pub model: Option<String>,

    /// Standing instructions sent with every model call.
    pub system_prompt: Option<String>,

    pub temperature: Option<f32>,

    pub max_tokens: Option<u32>,

    /// Maximum model calls per run.
    pub max_turns: u32,

    /// Maximum executed tool calls per run; later calls are skipped.
    pub max_tool_calls: Option<u32>,

    /// Per-call tool execution timeout.
    pub tool_timeout: Duration,

    /// Cap on simultaneously outstanding model and tool calls across all
    /// runs of this agent.
    pub max_concurrent_calls: Option<usize>,

    pub retry: RetryPolicy,

    pub compaction: CompactionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            max_turns: 50,
            max_tool_calls: None,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_concurrent_calls: None,
            retry: RetryPolicy::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub session_key: String,
    /// Model calls made.
    pub turns: u32,
    /// Tool calls executed (skipped calls are not counted).
    pub tool_calls: u32,
    /// The final assistant text.
    pub text: String,
    pub duration_ms: u64,
    /// Long-term memories injected into the prompt. No memory source is
    /// wired into the engine, so this is always `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memories_used: Option<u32>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles an [`Agent`].
pub struct AgentBuilder {
    provider: Arc<dyn ModelProvider>,
    store: Option<Arc<dyn SessionStore>>,
    tools: ToolRegistry,
    config: AgentConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
    events: Option<EventBus>,
    subagents: Option<SubagentConfig>,
    depth: u32,
}

impl AgentBuilder {
    fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            store: None,
            tools: ToolRegistry::new(),
            config: AgentConfig::default(),
            summarizer: None,
            events: None,
            subagents: None,
            depth: 0,
        }
    }

    /// Session store; defaults to a fresh [`MemorySessionStore`].
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Summarizer used by compaction; defaults to asking the provider.
    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Publish on an existing bus instead of a fresh one.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Expose the `delegate` tool backed by a [`SubagentManager`].
    pub fn subagents(mut self, config: SubagentConfig) -> Self {
        self.subagents = Some(config);
        self
    }

    pub(crate) fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn build(self) -> Agent {
        let model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| self.provider.model().to_string());
        let summarizer = self.summarizer.unwrap_or_else(|| {
            Arc::new(ProviderSummarizer::new(Arc::clone(&self.provider)).with_model(model.clone()))
        });
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        let base = Arc::new(self.tools);
        let (registry, subagents) = match self.subagents {
            Some(sub_config) => {
                let manager = Arc::new(SubagentManager::new(
                    Arc::clone(&self.provider),
                    Arc::new(base.without(DelegateTool::NAME)),
                    self.config.clone(),
                    Arc::clone(&summarizer),
                    sub_config,
                    self.depth,
                ));
                let mut full = (*base).clone();
                full.register(DelegateTool::new(Arc::clone(&manager)));
                (Arc::new(full), Some(manager))
            }
            None => (base, None),
        };

        let semaphore = self
            .config
            .max_concurrent_calls
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        Agent {
            inner: Arc::new(AgentInner {
                dispatcher: ToolDispatcher::new(registry, self.config.tool_timeout),
                compactor: Compactor::new(self.config.compaction.clone(), summarizer),
                provider: self.provider,
                store,
                events: self.events.unwrap_or_default(),
                model,
                config: self.config,
                active: DashMap::new(),
                semaphore,
                subagents,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// The orchestration engine.  Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    provider: Arc<dyn ModelProvider>,
    store: Arc<dyn SessionStore>,
    dispatcher: ToolDispatcher,
    compactor: Compactor,
    events: EventBus,
    model: String,
    config: AgentConfig,
    /// Session key -> the run currently holding it.
    active: DashMap<String, ActiveRun>,
    semaphore: Option<Arc<Semaphore>>,
    subagents: Option<Arc<SubagentManager>>,
}

struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
}

/// Releases a session key when dropped, including when the run future is
/// dropped mid-flight.
struct SessionSlot<'a> {
    active: &'a DashMap<String, ActiveRun>,
    key: String,
    run_id: Uuid,
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        self.active.remove_if(&self.key, |_, run| run.run_id == self.run_id);
    }
}

/// Mutable state of one in-flight run.
struct RunState {
    run_id: Uuid,
    session_key: String,
    history: Vec<Message>,
    cancel: CancellationToken,
    turns: u32,
    tool_calls: u32,
}

enum StreamFailure {
    Fatal(AgentError),
    Provider { error: ProviderError, emitted: bool },
}

impl Agent {
    pub fn builder(provider: Arc<dyn ModelProvider>) -> AgentBuilder {
        AgentBuilder::new(provider)
    }

    /// Run `input` against the session at `session_key`.
    ///
    /// # Errors
    ///
    /// [`AgentError::ConcurrentRun`] if a run is already active on the key
    /// (no events are emitted); otherwise the fatal error that ended the run,
    /// after `agent_error` has been emitted.
    pub async fn run(&self, session_key: &str, input: &str) -> Result<RunSummary> {
        self.run_with_cancel(session_key, input, CancellationToken::new())
            .await
    }

    /// [`run`](Self::run) with a caller-controlled cancellation token.
    pub async fn run_with_cancel(
        &self,
        session_key: &str,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let run_id = Uuid::now_v7();
        let _slot = self.claim(session_key, run_id, cancel.clone())?;
        let started = Instant::now();

        let history = self.inner.store.get(session_key).await?;
        let mut run = RunState {
            run_id,
            session_key: session_key.to_string(),
            history,
            cancel,
            turns: 0,
            tool_calls: 0,
        };
        run.history.push(Message::user(input));

        info!(
            run_id = %run_id,
            session_key,
            model = %self.inner.model,
            history = run.history.len(),
            "starting run"
        );
        self.emit(AgentEvent::AgentStart {
            run_id,
            session_key: session_key.to_string(),
            model: self.inner.model.clone(),
        });

        match self.drive(&mut run).await {
            Ok(text) => {
                self.compact(&mut run).await;
                if let Err(e) = self.inner.store.put(&run.session_key, &run.history).await {
                    return Err(self.fail(&run, e.into()));
                }
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    run_id = %run_id,
                    turns = run.turns,
                    tool_calls = run.tool_calls,
                    duration_ms,
                    "run completed"
                );
                self.emit(AgentEvent::AgentEnd { run_id });
                Ok(RunSummary {
                    run_id,
                    session_key: run.session_key,
                    turns: run.turns,
                    tool_calls: run.tool_calls,
                    text,
                    duration_ms,
                    memories_used: None,
                })
            }
            Err(err) => {
                if let Err(e) = self.inner.store.put(&run.session_key, &run.history).await {
                    warn!(run_id = %run_id, error = %e, "failed to persist partial history");
                }
                Err(self.fail(&run, err))
            }
        }
    }

    /// Delete the session at `session_key`.  Idempotent.
    ///
    /// # Errors
    ///
    /// [`AgentError::ConcurrentRun`] while a run is active on the key.
    pub async fn reset(&self, session_key: &str) -> Result<()> {
        let _slot = self.claim(session_key, Uuid::now_v7(), CancellationToken::new())?;
        self.inner.store.delete(session_key).await?;
        info!(session_key, "session reset");
        Ok(())
    }

    /// Persisted history of `session_key` (empty if unknown).
    pub async fn history(&self, session_key: &str) -> Result<Vec<Message>> {
        Ok(self.inner.store.get(session_key).await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.inner.store.list().await?)
    }

    /// Register an event handler on this agent's bus.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(handler)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Cancel the run active on `session_key`.  Returns whether one was found.
    pub fn cancel(&self, session_key: &str) -> bool {
        match self.inner.active.get(session_key) {
            Some(run) => {
                run.cancel.cancel();
                info!(session_key, run_id = %run.run_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel every active run.  Returns how many were signalled.
    pub fn shutdown(&self) -> usize {
        let mut cancelled = 0;
        for run in self.inner.active.iter() {
            run.cancel.cancel();
            cancelled += 1;
        }
        info!(cancelled, "agent shutdown requested");
        cancelled
    }

    pub fn is_running(&self, session_key: &str) -> bool {
        self.inner.active.contains_key(session_key)
    }

    pub fn active_runs(&self) -> usize {
        self.inner.active.len()
    }

    /// The effective model identifier.
    pub fn model(&self) -> &str {
        &self.inner.model
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        self.inner.dispatcher.registry()
    }

    pub fn subagents(&self) -> Option<&Arc<SubagentManager>> {
        self.inner.subagents.as_ref()
    }

    // -- internals -----------------------------------------------------------

    fn claim(
        &self,
        session_key: &str,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<SessionSlot<'_>> {
        match self.inner.active.entry(session_key.to_string()) {
            Entry::Occupied(_) => {
                debug!(session_key, "rejecting concurrent run");
                Err(AgentError::ConcurrentRun {
                    session_key: session_key.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveRun { run_id, cancel });
                Ok(SessionSlot {
                    active: &self.inner.active,
                    key: session_key.to_string(),
                    run_id,
                })
            }
        }
    }

    fn emit(&self, event: AgentEvent) {
        self.inner.events.publish(event);
    }

    fn fail(&self, run: &RunState, err: AgentError) -> AgentError {
        warn!(
            run_id = %run.run_id,
            session_key = %run.session_key,
            turns = run.turns,
            error = %err,
            "run failed"
        );
        self.emit(AgentEvent::AgentError {
            run_id: run.run_id,
            error: err.to_string(),
        });
        err
    }

    /// The turn loop.  Returns the final assistant text.
    async fn drive(&self, run: &mut RunState) -> Result<String> {
        let max_turns = self.inner.config.max_turns;
        for _ in 0..max_turns {
            if run.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            self.compact(run).await;

            run.turns += 1;
            debug!(run_id = %run.run_id, turn = run.turns, "turn start");
            let turn = self.call_model(run).await?;
            self.emit(AgentEvent::MessageEnd {
                run_id: run.run_id,
                text: turn.text.clone(),
            });

            if !turn.has_tool_calls() {
                run.history.push(Message::assistant(turn.text.clone()));
                return Ok(turn.text);
            }

            let results = self.execute_tool_calls(run, &turn.tool_calls).await?;
            let ModelTurn { text, tool_calls } = turn;
            run.history
                .push(Message::assistant_with_calls(text, tool_calls));
            run.history.push(Message::tool_results(results));
        }
        Err(AgentError::MaxTurnsExceeded { max_turns })
    }

    /// One model call, retried per the retry policy.
    async fn call_model(&self, run: &RunState) -> Result<ModelTurn> {
        let request = ChatRequest {
            model: self.inner.model.clone(),
            system_prompt: self.inner.config.system_prompt.clone(),
            messages: run.history.clone(),
            tools: self.inner.dispatcher.registry().definitions(),
            temperature: self.inner.config.temperature,
            max_tokens: self.inner.config.max_tokens,
        };
        let policy = &self.inner.config.retry;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let (error, emitted) = match self.stream_turn(run, &request).await {
                Ok(turn) => return Ok(turn),
                Err(StreamFailure::Fatal(err)) => return Err(err),
                Err(StreamFailure::Provider { error, emitted }) => (error, emitted),
            };
            if emitted || !policy.should_retry(attempt, &error) {
                return Err(AgentError::Provider {
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = policy.delay_for(attempt, &error);
            warn!(
                run_id = %run.run_id,
                attempt,
                delay = ?delay,
                error = %error,
                "model call failed, retrying"
            );
            tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One attempt at a model call, forwarding text deltas as they arrive.
    async fn stream_turn(
        &self,
        run: &RunState,
        request: &ChatRequest,
    ) -> std::result::Result<ModelTurn, StreamFailure> {
        let _permit = self
            .acquire(&run.cancel)
            .await
            .map_err(StreamFailure::Fatal)?;

        let sent = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(StreamFailure::Fatal(AgentError::Cancelled)),
            sent = self.inner.provider.send(request) => sent,
        };
        let mut stream = sent.map_err(|error| StreamFailure::Provider {
            error,
            emitted: false,
        })?;

        let mut acc = StreamAccumulator::new();
        let mut emitted = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Err(StreamFailure::Fatal(AgentError::Cancelled)),
                next = stream.next() => next,
            };
            let fragment = match next {
                None => break,
                Some(Ok(fragment)) => fragment,
                Some(Err(error)) => return Err(StreamFailure::Provider { error, emitted }),
            };
            match acc.apply(fragment) {
                Ok(Some(delta)) => {
                    emitted = true;
                    self.emit(AgentEvent::MessageDelta {
                        run_id: run.run_id,
                        delta,
                    });
                }
                Ok(None) => {}
                Err(error) => return Err(StreamFailure::Provider { error, emitted }),
            }
            if acc.is_done() {
                break;
            }
        }
        acc.into_turn()
            .map_err(|error| StreamFailure::Provider { error, emitted })
    }

    /// Dispatch every call of a turn in emission order.
    async fn execute_tool_calls(
        &self,
        run: &mut RunState,
        calls: &[ToolCall],
    ) -> Result<Vec<ToolResult>> {
        let mut seen = HashSet::with_capacity(calls.len());
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            if run.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            self.emit(AgentEvent::ToolExecutionStart {
                run_id: run.run_id,
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                args: call.input.clone(),
            });

            let budget = self
                .inner
                .config
                .max_tool_calls
                .filter(|&limit| run.tool_calls >= limit);
            let result = if !seen.insert(call.id.as_str()) {
                to_result(
                    &call.id,
                    &ToolError::DuplicateCall {
                        call_id: call.id.clone(),
                    },
                )
            } else if let Some(limit) = budget {
                to_result(&call.id, &ToolError::BudgetExhausted { limit })
            } else {
                self.dispatch(run, call).await?
            };

            if result.skipped {
                let reason = result
                    .error
                    .as_ref()
                    .map(|f| f.message.clone())
                    .unwrap_or_default();
                debug!(run_id = %run.run_id, tool = %call.name, %reason, "tool call skipped");
                self.emit(AgentEvent::ToolSkipped {
                    run_id: run.run_id,
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    reason,
                });
            } else {
                run.tool_calls += 1;
                let content = result.content_text();
                debug!(
                    run_id = %run.run_id,
                    tool = %call.name,
                    is_error = result.is_error(),
                    preview = %text::preview(&content, 120),
                    "tool call finished"
                );
                self.emit(AgentEvent::ToolExecutionEnd {
                    run_id: run.run_id,
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    result: content,
                    is_error: result.is_error(),
                });
            }
            results.push(result);
        }
        Ok(results)
    }

    async fn dispatch(&self, run: &RunState, call: &ToolCall) -> Result<ToolResult> {
        let ctx = ToolContext {
            run_id: run.run_id,
            session_key: run.session_key.clone(),
            call_id: call.id.clone(),
            events: self.inner.events.clone(),
            cancel: run.cancel.clone(),
        };
        let _permit = self.acquire(&run.cancel).await?;
        tokio::select! {
            biased;
            _ = run.cancel.cancelled() => Err(AgentError::Cancelled),
            result = self.inner.dispatcher.dispatch(call, &ctx) => Ok(result),
        }
    }

    /// Take a slot from the global call cap, if one is configured.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(semaphore) = &self.inner.semaphore else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            permit = Arc::clone(semaphore).acquire_owned() => permit
                .map(Some)
                .map_err(|_| AgentError::Internal("call semaphore closed".into())),
        }
    }

    /// Compact the run's history if it is over budget.  Never fails the run.
    async fn compact(&self, run: &mut RunState) {
        if !self.inner.compactor.needs_compaction(&run.history) {
            return;
        }
        match self.inner.compactor.maybe_compact(&run.history).await {
            Ok(Compacted::Unchanged) => {}
            Ok(Compacted::Compacted {
                history,
                summary_chars,
                dropped_messages,
            }) => {
                run.history = history;
                self.emit(AgentEvent::Compaction {
                    run_id: run.run_id,
                    summary_chars,
                    dropped_messages,
                });
            }
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "compaction failed, keeping full history");
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.inner.model)
            .field("tools", &self.inner.dispatcher.registry().names())
            .field("active_runs", &self.inner.active.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
