//! Agent error types.
//!
//! Only [`AgentError`] ever reaches the caller of a run.  The other enums
//! describe failures that the engine converts into data: tool failures
//! become [`ToolResult`](miniagent_kernel::ToolResult)s, compaction
//! failures are logged, subagent failures surface as events and tool
//! results.

use std::time::Duration;

use miniagent_kernel::ToolFailureKind;

/// Fatal outcome of a run.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Concurrency ---------------------------------------------------------
    /// Another run is already in flight on this session key.
    #[error("a run is already active for session `{session_key}`")]
    ConcurrentRun { session_key: String },

    /// The run was cancelled before it completed.
    #[error("run cancelled")]
    Cancelled,

    // -- Provider ------------------------------------------------------------
    /// The model provider kept failing after the retry budget was spent, or
    /// failed in a way that cannot be retried.
    #[error("model provider failed after {attempts} attempt(s): {source}")]
    Provider {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    // -- Runtime -------------------------------------------------------------
    /// The loop hit the turn ceiling while the model was still calling tools.
    #[error("run exceeded max turns ({max_turns})")]
    MaxTurnsExceeded { max_turns: u32 },

    /// Reading or writing session history failed.
    #[error("session store error: {0}")]
    Store(#[from] miniagent_store::StoreError),

    // -- Configuration -------------------------------------------------------
    #[error("config error: {reason}")]
    Config { reason: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Failure reported by a [`ModelProvider`](crate::provider::ModelProvider).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// Connection-level failure (DNS, TLS, reset, 5xx).
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// Credentials were rejected.
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    /// The provider asked us to slow down.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The response stream broke off or produced garbage mid-flight.
    #[error("stream error: {reason}")]
    Stream { reason: String },

    /// The provider answered with something that cannot be used (bad
    /// request, malformed tool call, exhausted script).
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl ProviderError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn stream(reason: impl Into<String>) -> Self {
        Self::Stream {
            reason: reason.into(),
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth { .. } | Self::InvalidResponse { .. })
    }

    /// Server-provided backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tool errors
// ---------------------------------------------------------------------------

/// A tool call that did not produce a successful result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("invalid input for `{tool_name}`: {reason}")]
    Validation { tool_name: String, reason: String },

    #[error("`{tool_name}` failed: {reason}")]
    Execution { tool_name: String, reason: String },

    #[error("`{tool_name}` timed out after {timeout:?}")]
    Timeout { tool_name: String, timeout: Duration },

    #[error("no tool named `{tool_name}` is registered")]
    UnknownTool { tool_name: String },

    #[error("duplicate tool call id `{call_id}` in one turn")]
    DuplicateCall { call_id: String },

    #[error("tool call budget of {limit} exhausted")]
    BudgetExhausted { limit: u32 },
}

impl ToolError {
    pub fn kind(&self) -> ToolFailureKind {
        match self {
            Self::Validation { .. } => ToolFailureKind::Validation,
            Self::Execution { .. } => ToolFailureKind::Execution,
            Self::Timeout { .. } => ToolFailureKind::Timeout,
            Self::UnknownTool { .. } => ToolFailureKind::UnknownTool,
            Self::DuplicateCall { .. } => ToolFailureKind::DuplicateCall,
            Self::BudgetExhausted { .. } => ToolFailureKind::BudgetExhausted,
        }
    }

    /// Whether the tool body never ran.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::UnknownTool { .. } | Self::DuplicateCall { .. } | Self::BudgetExhausted { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Compaction and subagent errors
// ---------------------------------------------------------------------------

/// History could not be compacted; the run continues uncompacted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompactionError {
    #[error("summarizer failed: {0}")]
    Summarizer(#[from] ProviderError),

    #[error("summarizer returned an empty summary")]
    EmptySummary,
}

/// A delegated subagent did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("subagent{} failed: {reason}", .label.as_deref().map(|l| format!(" `{l}`")).unwrap_or_default())]
pub struct SubagentError {
    pub label: Option<String>,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_error_class() {
        assert!(ProviderError::transport("reset").is_retryable());
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(
            !ProviderError::Auth {
                reason: "bad key".into()
            }
            .is_retryable()
        );
        assert!(
            !ProviderError::InvalidResponse {
                reason: "nope".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn tool_errors_map_to_failure_kinds() {
        let unknown = ToolError::UnknownTool {
            tool_name: "x".into(),
        };
        assert_eq!(unknown.kind(), ToolFailureKind::UnknownTool);
        assert!(unknown.is_skip());

        let timeout = ToolError::Timeout {
            tool_name: "x".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(!timeout.is_skip());
    }

    #[test]
    fn provider_error_display_includes_attempts() {
        let err = AgentError::Provider {
            attempts: 3,
            source: ProviderError::transport("connection reset"),
        };
        assert_eq!(
            err.to_string(),
            "model provider failed after 3 attempt(s): transport error: connection reset"
        );
    }

    #[test]
    fn subagent_error_mentions_label() {
        let err = SubagentError {
            label: Some("research".into()),
            reason: "boom".into(),
        };
        assert_eq!(err.to_string(), "subagent `research` failed: boom");
        let unlabeled = SubagentError {
            label: None,
            reason: "boom".into(),
        };
        assert_eq!(unlabeled.to_string(), "subagent failed: boom");
    }
}
