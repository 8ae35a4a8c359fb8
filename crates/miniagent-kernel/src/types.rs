//! Conversation data model.
//!
//! A session's history is an ordered list of [`Message`]s.  Messages are
//! immutable once appended: the turn loop only ever pushes new messages, and
//! compaction replaces a prefix wholesale with a single summary message.
//!
//! Assistant messages carry the model's text plus any [`ToolCall`]s it
//! requested; the following `tool` message carries one [`ToolResult`] per
//! call, in emission order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Input from the human user (also used for compaction summaries).
    User,
    /// Output from the model.
    Assistant,
    /// Results of tool invocations, fed back to the model.
    Tool,
}

impl Role {
    /// Lowercase wire name of this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message payload: either plain text or a sequence of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One typed block inside a structured message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Free text.
    Text { text: String },
    /// A tool invocation requested by the model.
    ToolCall(ToolCall),
    /// The outcome of a tool invocation.
    ToolResult(ToolResult),
}

/// A single message in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// Text or structured content.
    pub content: MessageContent,

    /// Set only on the synthetic message produced by compaction.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
}

impl Message {
    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            summary: false,
        }
    }

    /// Create an assistant text message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            summary: false,
        }
    }

    /// Create an assistant message from the text produced in a turn and the
    /// tool calls it requested.  Empty text is omitted.
    pub fn assistant_with_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        let mut blocks = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            blocks.push(ContentBlock::Text { text });
        }
        blocks.extend(calls.into_iter().map(ContentBlock::ToolCall));
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
            summary: false,
        }
    }

    /// Create the single `tool` message that carries every result of a turn.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Blocks(
                results.into_iter().map(ContentBlock::ToolResult).collect(),
            ),
            summary: false,
        }
    }

    /// Create a compaction summary message.
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            summary: true,
        }
    }

    /// Concatenated text of the message (text blocks only).
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Tool calls requested in this message, in emission order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.blocks().iter().filter_map(|b| match b {
            ContentBlock::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    /// Tool results carried by this message, in call order.
    pub fn tool_results_iter(&self) -> impl Iterator<Item = &ToolResult> {
        self.blocks().iter().filter_map(|b| match b {
            ContentBlock::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    /// Approximate size of the message in characters.
    ///
    /// Counts text, tool names, serialized tool inputs and tool result
    /// content.  This is the unit the compaction budget is expressed in.
    pub fn char_len(&self) -> usize {
        match &self.content {
            MessageContent::Text(text) => text.chars().count(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.chars().count(),
                    ContentBlock::ToolCall(call) => {
                        call.name.chars().count() + call.input.to_string().chars().count()
                    }
                    ContentBlock::ToolResult(result) => result.content_text().chars().count(),
                })
                .sum(),
        }
    }

    fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the model, unique within one assistant turn.
    pub id: String,

    /// Name of the tool to invoke.
    pub name: String,

    /// Arguments as a JSON object.  The structure depends on the tool's schema.
    #[serde(default)]
    pub input: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Classification of a failed or skipped tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    /// Input did not satisfy the tool's declared schema.
    Validation,
    /// The tool body returned an error or panicked.
    Execution,
    /// The tool did not finish within the configured timeout.
    Timeout,
    /// No tool is registered under the requested name.
    UnknownTool,
    /// The call id repeats an earlier call in the same turn.
    DuplicateCall,
    /// The run's tool-call budget was already spent.
    BudgetExhausted,
}

impl ToolFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::UnknownTool => "unknown_tool",
            Self::DuplicateCall => "duplicate_call",
            Self::BudgetExhausted => "budget_exhausted",
        }
    }
}

/// Error descriptor attached to a [`ToolResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ToolFailureKind,
    pub message: String,
}

/// The outcome of one tool call, ready to feed back to the model.
///
/// Every dispatched call yields exactly one result.  `skipped` means the tool
/// body never ran; an `error` without `skipped` means it was attempted and
/// failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The [`ToolCall::id`] this result corresponds to.
    pub call_id: String,

    /// Text or structured payload shown to the model.
    pub content: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

impl ToolResult {
    /// Successful result.
    pub fn success(call_id: impl Into<String>, content: Value) -> Self {
        Self {
            call_id: call_id.into(),
            content,
            error: None,
            skipped: false,
        }
    }

    /// The tool was attempted and failed.
    pub fn failed(
        call_id: impl Into<String>,
        kind: ToolFailureKind,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            call_id: call_id.into(),
            content: Value::String(format!("Error: {message}")),
            error: Some(ToolFailure { kind, message }),
            skipped: false,
        }
    }

    /// The tool body never ran.
    pub fn skipped(
        call_id: impl Into<String>,
        kind: ToolFailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            skipped: true,
            ..Self::failed(call_id, kind, message)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Content rendered as text: strings verbatim, anything else as JSON.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session keys
// ---------------------------------------------------------------------------

/// Agent id used when none is given.
pub const DEFAULT_AGENT_ID: &str = "main";

/// Session id used when none is given.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Build the canonical session key `agent:<agent_id>:<session_id>`.
///
/// Components are trimmed; blank components fall back to
/// [`DEFAULT_AGENT_ID`] and [`DEFAULT_SESSION_ID`].
pub fn resolve_session_key(agent_id: Option<&str>, session_id: Option<&str>) -> String {
    let agent = agent_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_AGENT_ID);
    let session = session_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SESSION_ID);
    format!("agent:{agent}:{session}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let back: Role = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(back, Role::Tool);
    }

    #[test]
    fn text_message_serializes_as_plain_string() {
        let msg = Message::user("hello");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"role": "user", "content": "hello"}));
    }

    #[test]
    fn structured_message_survives_serde() {
        let msg = Message::assistant_with_calls(
            "checking",
            vec![ToolCall::new("c1", "exec", json!({"command": "ls"}))],
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"tool_call\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.tool_calls().count(), 1);
        assert_eq!(back.text(), "checking");
    }

    #[test]
    fn assistant_with_calls_omits_empty_text() {
        let msg = Message::assistant_with_calls("", vec![ToolCall::new("c1", "t", json!({}))]);
        match &msg.content {
            MessageContent::Blocks(blocks) => assert_eq!(blocks.len(), 1),
            MessageContent::Text(_) => panic!("expected blocks"),
        }
    }

    #[test]
    fn skipped_result_carries_error_and_flag() {
        let result = ToolResult::skipped("c1", ToolFailureKind::UnknownTool, "no tool `x`");
        assert!(result.skipped);
        assert!(result.is_error());
        assert_eq!(result.content_text(), "Error: no tool `x`");

        let msg = Message::tool_results(vec![result.clone()]);
        let back: Message = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(back.tool_results_iter().next(), Some(&result));
    }

    #[test]
    fn summary_flag_defaults_to_false() {
        let msg: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert!(!msg.summary);
        assert!(Message::summary("s").summary);
    }

    #[test]
    fn char_len_counts_blocks() {
        let msg = Message::assistant_with_calls("ab", vec![ToolCall::new("c", "x", json!(1))]);
        // "ab" + "x" + "1"
        assert_eq!(msg.char_len(), 4);
        assert_eq!(Message::user("héllo").char_len(), 5);
    }

    #[test]
    fn session_key_defaults() {
        assert_eq!(resolve_session_key(None, None), "agent:main:default");
        assert_eq!(
            resolve_session_key(Some(" ops "), Some("s1")),
            "agent:ops:s1"
        );
        assert_eq!(resolve_session_key(Some(""), Some("  ")), "agent:main:default");
    }
}
