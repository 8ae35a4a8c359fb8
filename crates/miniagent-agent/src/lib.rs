//! Agent orchestration engine for miniagent.
//!
//! Drives a conversation between a user, a streaming model provider and a
//! set of tools, persisting each session's history between runs.
//!
//! ## Architecture
//!
//! ```text
//!   run(session_key, input)
//!          │
//!   ┌──────┴──────┐    ┌───────────────┐    ┌──────────────┐
//!   │  Turn loop  │───>│ ModelProvider │    │ SessionStore │
//!   │  (runtime)  │    │ (streaming)   │    │ (get / put)  │
//!   └──┬───┬───┬──┘    └───────────────┘    └──────▲───────┘
//!      │   │   └──────────────────────────────────┘
//!      │   └──> Compactor ──> Summarizer
//!      │
//!   ┌──┴─────────────┐     ┌──────────────────┐
//!   │ ToolDispatcher │────>│ ToolRegistry     │
//!   │ (validate,     │     │ (+ delegate ──>  │
//!   │  timeout)      │     │  SubagentManager)│
//!   └────────────────┘     └──────────────────┘
//!          every step ──> EventBus ──> subscribers
//! ```
//!
//! ## Modules
//!
//! - [`runtime`] -- [`Agent`], the turn loop and per-session concurrency.
//! - [`provider`] -- The model provider seam, stream accumulation, retries,
//!   and a scripted provider for deterministic runs.
//! - [`tools`] -- Tool trait, registry, schema validation and dispatch.
//! - [`compaction`] -- History summarization when a session grows too large.
//! - [`subagent`] -- Delegation of tasks to restricted child agents.
//! - [`config`] -- File and environment configuration.
//! - [`error`] -- Error types.

pub mod compaction;
pub mod config;
pub mod error;
pub mod provider;
pub mod runtime;
pub mod subagent;
pub mod tools;

pub use compaction::{Compacted, CompactionConfig, Compactor, ProviderSummarizer, Summarizer};
pub use config::EngineConfig;
pub use error::{
    AgentError, CompactionError, ProviderError, Result, SubagentError, ToolError,
};
pub use provider::{
    ChatRequest, ModelProvider, ModelTurn, ResponseFragment, ResponseStream, RetryPolicy,
    ScriptedProvider, ScriptedTurn, StreamAccumulator, ToolDefinition,
};
pub use runtime::{Agent, AgentBuilder, AgentConfig, RunSummary};
pub use subagent::{DelegateTool, ParentLink, SubagentConfig, SubagentManager, SubagentOutcome};
pub use tools::{
    BoxError, FunctionTool, Tool, ToolContext, ToolDispatcher, ToolOutput, ToolRegistry,
};

pub use miniagent_kernel::{
    AgentEvent, EventBus, Message, Role, Subscription, ToolCall, ToolResult, resolve_session_key,
};
pub use miniagent_store::{MemorySessionStore, SessionStore, SqliteSessionStore};
