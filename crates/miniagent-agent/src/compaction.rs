//! Context compaction -- replace old history with a summary so a session's
//! size stays within budget.
//!
//! When the history's size (see [`Message::char_len`]) exceeds
//! [`CompactionConfig::max_chars`]:
//!
//! 1. The most recent [`keep_recent`](CompactionConfig::keep_recent)
//!    messages form the tail, which is never touched.  The tail is widened so
//!    it never opens on a `tool` message, keeping every tool result next to
//!    the assistant message that requested it.
//! 2. The shortest prefix whose removal brings the rest (plus room for the
//!    summary) under budget is chosen; if no prefix suffices, everything
//!    before the tail is taken.
//! 3. A [`Summarizer`] condenses that prefix into text, which replaces the
//!    prefix as a single summary message.
//!
//! Under budget the history is returned untouched, so compacting an already
//! compacted history is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use miniagent_kernel::{Message, Role, text};
use tracing::{debug, info};

use crate::error::{CompactionError, ProviderError};
use crate::provider::{ChatRequest, ModelProvider, StreamAccumulator};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionConfig {
    /// Master switch; disabled compaction never summarizes.
    pub enabled: bool,
    /// Size budget for a session's history, in characters.
    pub max_chars: usize,
    /// Number of most recent messages that are always preserved verbatim.
    pub keep_recent: usize,
    /// Upper bound on the summary message, in characters.
    pub summary_max_chars: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chars: 100_000,
            keep_recent: 10,
            summary_max_chars: 4_000,
        }
    }
}

impl CompactionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Summarizer
// ---------------------------------------------------------------------------

/// Produces a condensed description of a slice of history.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, ProviderError>;
}

/// [`Summarizer`] that asks a [`ModelProvider`] for the summary.
pub struct ProviderSummarizer {
    provider: Arc<dyn ModelProvider>,
    model: String,
    max_tokens: u32,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        let model = provider.model().to_string();
        Self {
            provider,
            model,
            max_tokens: 1024,
        }
    }

    /// Summarize with a different model than the provider's default.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let prompt = format!(
            "Summarize the following conversation concisely, preserving key facts, decisions, \
             tool results, and context needed to continue the conversation. Be factual and \
             brief.\n\n{}",
            format_messages_for_summary(messages)
        );
        let request = ChatRequest {
            model: self.model.clone(),
            system_prompt: None,
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            temperature: Some(0.0),
            max_tokens: Some(self.max_tokens),
        };

        debug!(model = %self.model, messages = messages.len(), "requesting summary");
        let mut stream = self.provider.send(&request).await?;
        let mut acc = StreamAccumulator::new();
        while let Some(fragment) = stream.next().await {
            acc.apply(fragment?)?;
            if acc.is_done() {
                break;
            }
        }
        Ok(acc.into_turn()?.text)
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Total size of `messages` in the unit the budget is expressed in.
pub fn estimate_chars(messages: &[Message]) -> usize {
    messages.iter().map(Message::char_len).sum()
}

/// Whether `messages` is over budget.
pub fn needs_compaction(messages: &[Message], config: &CompactionConfig) -> bool {
    config.enabled && estimate_chars(messages) > config.max_chars
}

/// Number of leading messages to replace, or `None` when nothing can or
/// needs to be compacted.
pub fn plan_split(messages: &[Message], config: &CompactionConfig) -> Option<usize> {
    if !needs_compaction(messages, config) {
        return None;
    }

    let mut tail_start = messages.len().saturating_sub(config.keep_recent);
    while tail_start > 0 && messages.get(tail_start).map(|m| m.role) == Some(Role::Tool) {
        tail_start -= 1;
    }
    if tail_start == 0 {
        return None;
    }

    // suffix[i] = size of messages[i..]
    let mut suffix = vec![0usize; messages.len() + 1];
    for i in (0..messages.len()).rev() {
        suffix[i] = suffix[i + 1] + messages[i].char_len();
    }

    let fits = |k: usize| suffix[k] + config.summary_max_chars <= config.max_chars;
    let boundary = |k: usize| messages.get(k).is_none_or(|m| m.role != Role::Tool);
    let split = (1..=tail_start)
        .find(|&k| boundary(k) && fits(k))
        .unwrap_or(tail_start);

    // A prefix holding only earlier summaries has nothing new to fold in.
    if messages[..split].iter().all(|m| m.summary) {
        return None;
    }
    Some(split)
}

/// Outcome of [`Compactor::maybe_compact`].
#[derive(Debug, Clone, PartialEq)]
pub enum Compacted {
    /// Under budget, or nothing eligible; the history is unchanged.
    Unchanged,
    /// A prefix was replaced by one summary message.
    Compacted {
        history: Vec<Message>,
        summary_chars: usize,
        dropped_messages: usize,
    },
}

/// Applies a [`CompactionConfig`] using a [`Summarizer`].
pub struct Compactor {
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl Compactor {
    pub fn new(config: CompactionConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { config, summarizer }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn needs_compaction(&self, messages: &[Message]) -> bool {
        needs_compaction(messages, &self.config)
    }

    /// Compact `history` if it is over budget.
    ///
    /// # Errors
    ///
    /// Fails when the summarizer fails or returns only whitespace; the
    /// caller should keep the uncompacted history.
    pub async fn maybe_compact(&self, history: &[Message]) -> Result<Compacted, CompactionError> {
        let Some(split) = plan_split(history, &self.config) else {
            if self.needs_compaction(history) {
                debug!(
                    messages = history.len(),
                    keep_recent = self.config.keep_recent,
                    "over budget but nothing outside the tail window to compact"
                );
            }
            return Ok(Compacted::Unchanged);
        };

        let (prefix, tail) = history.split_at(split);
        info!(
            dropped = prefix.len(),
            kept = tail.len(),
            size = estimate_chars(history),
            budget = self.config.max_chars,
            "compacting conversation history"
        );

        let summary = self.summarizer.summarize(prefix).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(CompactionError::EmptySummary);
        }

        let content = format!(
            "[Conversation summary of {count} earlier messages]\n{summary}",
            count = prefix.len()
        );
        let content = text::truncate_chars(&content, self.config.summary_max_chars).to_string();
        let summary_chars = content.chars().count();

        let mut compacted = Vec::with_capacity(tail.len() + 1);
        compacted.push(Message::summary(content));
        compacted.extend_from_slice(tail);

        info!(
            original = history.len(),
            compacted = compacted.len(),
            size = estimate_chars(&compacted),
            "compaction complete"
        );
        Ok(Compacted::Compacted {
            history: compacted,
            summary_chars,
            dropped_messages: prefix.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Render messages as a plain transcript for the summarizer prompt.
fn format_messages_for_summary(messages: &[Message]) -> String {
    let mut buf = String::with_capacity(messages.len() * 200);
    for msg in messages {
        let label = match (msg.role, msg.summary) {
            (_, true) => "Summary",
            (Role::User, false) => "User",
            (Role::Assistant, false) => "Assistant",
            (Role::Tool, false) => "Tool",
        };
        buf.push_str(label);
        buf.push_str(": ");
        buf.push_str(&msg.text());
        for call in msg.tool_calls() {
            buf.push_str(&format!("\n  [tool_call: {}({})]", call.name, call.input));
        }
        for result in msg.tool_results_iter() {
            let status = if result.is_error() { "error" } else { "ok" };
            buf.push_str(&format!(
                "\n  [tool_result {status}: {}]",
                text::preview(&result.content_text(), 500)
            ));
        }
        buf.push('\n');
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
