//! miniagent kernel.
//!
//! Foundational types shared by every miniagent crate:
//!
//! - **[`types`]** -- The conversation data model: [`Message`],
//!   [`ContentBlock`], [`ToolCall`], [`ToolResult`] and session key
//!   resolution.
//! - **[`events`]** -- The typed [`AgentEvent`] union and the synchronous,
//!   in-order [`EventBus`] that observers subscribe to.
//! - **[`text`]** -- Small char-boundary-safe string helpers used for
//!   previews and summary truncation.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod events;
pub mod text;
pub mod types;

// Re-export the most commonly used types at the crate root for convenience.
pub use events::{AgentEvent, EventBus, EventHandler, Subscription};
pub use types::{
    ContentBlock, DEFAULT_AGENT_ID, DEFAULT_SESSION_ID, Message, MessageContent, Role, ToolCall,
    ToolFailure, ToolFailureKind, ToolResult, resolve_session_key,
};
