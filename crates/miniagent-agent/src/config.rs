//! Engine configuration.
//!
//! [`EngineConfig`] is the file-level view of every tunable in the engine.
//! It is loaded from TOML or JSON (chosen by file extension), optionally
//! overridden from `MINIAGENT_*` environment variables, validated, and then
//! converted into the runtime types ([`AgentConfig`], [`RetryPolicy`],
//! [`CompactionConfig`], [`SubagentConfig`]).
//!
//! ```toml
//! [agent]
//! model = "claude-sonnet"
//! max_turns = 30
//!
//! [tools]
//! timeout_secs = 120
//!
//! [compaction]
//! max_chars = 60000
//!
//! [subagent]
//! enabled = true
//! allowed_tools = ["read_file", "exec"]
//! ```
//!
//! Every section and field is optional; omitted values take the defaults of
//! the corresponding runtime type.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use miniagent_store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::compaction::CompactionConfig;
use crate::error::{AgentError, Result};
use crate::provider::{ModelProvider, RetryPolicy};
use crate::runtime::{Agent, AgentBuilder, AgentConfig};
use crate::subagent::SubagentConfig;

/// Prefix of every environment variable [`EngineConfig::apply_env_overrides`]
/// looks at.
pub const ENV_PREFIX: &str = "MINIAGENT_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub retry: RetrySection,
    pub compaction: CompactionSection,
    pub subagent: SubagentSection,
    pub concurrency: ConcurrencySection,
    pub store: StoreSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_turns: u32,
    pub max_tool_calls: Option<u32>,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            model: defaults.model,
            system_prompt: defaults.system_prompt,
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            max_turns: defaults.max_turns,
            max_tool_calls: defaults.max_tool_calls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            timeout_secs: AgentConfig::default().tool_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            backoff_factor: policy.backoff_factor,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSection {
    pub enabled: bool,
    pub max_chars: usize,
    pub keep_recent: usize,
    pub summary_max_chars: usize,
}

impl Default for CompactionSection {
    fn default() -> Self {
        let c = CompactionConfig::default();
        Self {
            enabled: c.enabled,
            max_chars: c.max_chars,
            keep_recent: c.keep_recent,
            summary_max_chars: c.summary_max_chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentSection {
    /// Whether the `delegate` tool is exposed at all.
    pub enabled: bool,
    pub max_turns: u32,
    pub max_tool_calls: u32,
    pub max_depth: u32,
    pub allowed_tools: Option<Vec<String>>,
    pub system_prompt: Option<String>,
}

impl Default for SubagentSection {
    fn default() -> Self {
        let s = SubagentConfig::default();
        Self {
            enabled: false,
            max_turns: s.max_turns,
            max_tool_calls: s.max_tool_calls,
            max_depth: s.max_depth,
            allowed_tools: s.allowed_tools,
            system_prompt: s.system_prompt,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySection {
    pub max_concurrent_calls: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite database file; sessions are kept in memory when unset.
    pub path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Load from a `.json` or TOML file.  A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = ?path, "configuration file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        info!(path = ?path, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| AgentError::Config {
            reason: format!("failed to parse JSON config: {e}"),
        })
    }

    /// Apply `MINIAGENT_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars().filter(|(k, _)| k.starts_with(ENV_PREFIX)))
    }

    /// Apply `(name, value)` overrides.  Unrecognised names are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "MODEL" => self.agent.model = Some(value.to_string()),
                "SYSTEM_PROMPT" => self.agent.system_prompt = Some(value.to_string()),
                "MAX_TURNS" => self.agent.max_turns = parse(key, value)?,
                "TOOL_TIMEOUT_SECS" => self.tools.timeout_secs = parse(key, value)?,
                "COMPACTION_MAX_CHARS" => self.compaction.max_chars = parse(key, value)?,
                "COMPACTION_KEEP_RECENT" => self.compaction.keep_recent = parse(key, value)?,
                "MAX_CONCURRENT_CALLS" => {
                    self.concurrency.max_concurrent_calls = Some(parse(key, value)?)
                }
                "STORE_PATH" => self.store.path = Some(PathBuf::from(value)),
                _ => continue,
            }
            debug!(key, "configuration override applied");
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(AgentError::Config {
                reason: reason.to_string(),
            })
        };
        if self.agent.max_turns == 0 {
            return fail("agent.max_turns must be at least 1");
        }
        if self
            .agent
            .temperature
            .is_some_and(|t| !(0.0..=2.0).contains(&t))
        {
            return fail("agent.temperature must be between 0 and 2");
        }
        if self.tools.timeout_secs == 0 {
            return fail("tools.timeout_secs must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_factor < 1.0 {
            return fail("retry.backoff_factor must be at least 1.0");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return fail("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.compaction.enabled && self.compaction.summary_max_chars >= self.compaction.max_chars
        {
            return fail("compaction.summary_max_chars must be smaller than compaction.max_chars");
        }
        if self.subagent.max_turns == 0 {
            return fail("subagent.max_turns must be at least 1");
        }
        if self.concurrency.max_concurrent_calls == Some(0) {
            return fail("concurrency.max_concurrent_calls must be at least 1");
        }
        Ok(())
    }

    // -- conversions ---------------------------------------------------------

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            backoff_factor: self.retry.backoff_factor,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn compaction_config(&self) -> CompactionConfig {
        CompactionConfig {
            enabled: self.compaction.enabled,
            max_chars: self.compaction.max_chars,
            keep_recent: self.compaction.keep_recent,
            summary_max_chars: self.compaction.summary_max_chars,
        }
    }

    /// `None` when delegation is disabled.
    pub fn subagent_config(&self) -> Option<SubagentConfig> {
        self.subagent.enabled.then(|| SubagentConfig {
            max_turns: self.subagent.max_turns,
            max_tool_calls: self.subagent.max_tool_calls,
            max_depth: self.subagent.max_depth,
            allowed_tools: self.subagent.allowed_tools.clone(),
            system_prompt: self.subagent.system_prompt.clone(),
        })
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            model: self.agent.model.clone(),
            system_prompt: self.agent.system_prompt.clone(),
            temperature: self.agent.temperature,
            max_tokens: self.agent.max_tokens,
            max_turns: self.agent.max_turns,
            max_tool_calls: self.agent.max_tool_calls,
            tool_timeout: Duration::from_secs(self.tools.timeout_secs),
            max_concurrent_calls: self.concurrency.max_concurrent_calls,
            retry: self.retry_policy(),
            compaction: self.compaction_config(),
        }
    }

    /// Open the configured session store.
    pub async fn open_store(&self) -> Result<Arc<dyn SessionStore>> {
        match &self.store.path {
            Some(path) => {
                let store = SqliteSessionStore::open(path.clone()).await?;
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(MemorySessionStore::new())),
        }
    }

    /// A validated builder carrying every setting of this configuration.
    pub async fn agent_builder(&self, provider: Arc<dyn ModelProvider>) -> Result<AgentBuilder> {
        self.validate()?;
        let mut builder = Agent::builder(provider)
            .config(self.agent_config())
            .store(self.open_store().await?);
        if let Some(sub) = self.subagent_config() {
            builder = builder.subagents(sub);
        }
        Ok(builder)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| AgentError::Config {
        reason: format!("invalid value for {key}: {value:?}"),
    })
}
