//! Configuration loading, validation, and management for Palaver.
//!
//! Loads configuration from `~/.palaver/config.toml` with environment
//! variable overrides. Validates all settings at startup and warns about
//! values that are legal but probably not what the operator meant.

use palaver_core::approval::AutonomyLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.palaver/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Conversation loop settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// Context window and compaction settings
    #[serde(default)]
    pub context: ContextSettings,

    /// Per-conversation dispatcher settings
    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    /// Conversation reset behavior
    #[serde(default)]
    pub reset: ResetSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// System prompt sent with every model call
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Maximum model rounds per turn (0 = runtime default of 10)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Tool output is truncated to this many bytes (0 = unlimited)
    #[serde(default = "default_tool_output_cap")]
    pub tool_output_cap: usize,

    /// Maximum tokens per model response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Tool approval policy
    #[serde(default)]
    pub autonomy: AutonomyLevel,
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the available tools when they help answer the user.".into()
}
fn default_max_iterations() -> usize {
    10
}
fn default_tool_output_cap() -> usize {
    16 * 1024
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_iterations: default_max_iterations(),
            tool_output_cap: default_tool_output_cap(),
            max_tokens: None,
            autonomy: AutonomyLevel::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Estimated-token budget for system prompt + history (0 = never compact)
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Messages kept verbatim when compacting (0 = keep everything)
    #[serde(default = "default_recent_message_count")]
    pub recent_message_count: usize,

    /// Response budget for the summarization call
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

fn default_max_context_tokens() -> usize {
    100_000
}
fn default_recent_message_count() -> usize {
    20
}
fn default_summary_max_tokens() -> u32 {
    1024
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            recent_message_count: default_recent_message_count(),
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Inbound messages buffered per conversation (0 is treated as 1)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Poll interval used while waiting for the dispatcher to go idle
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,
}

fn default_queue_capacity() -> usize {
    16
}
fn default_idle_poll_interval_ms() -> u64 {
    25
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetSettings {
    /// Inbound text that clears the conversation
    #[serde(default = "default_reset_command")]
    pub command: String,

    /// Archive a summary of the cleared history to long-term memory
    #[serde(default = "default_true")]
    pub archive_summary: bool,

    /// Budget for the background archive summary
    #[serde(default = "default_summary_timeout_secs")]
    pub summary_timeout_secs: u64,
}

fn default_reset_command() -> String {
    "/reset".into()
}
fn default_true() -> bool {
    true
}
fn default_summary_timeout_secs() -> u64 {
    60
}

impl Default for ResetSettings {
    fn default() -> Self {
        Self {
            command: default_reset_command(),
            archive_summary: true,
            summary_timeout_secs: default_summary_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.palaver/config.toml).
    ///
    /// Environment variables override file values:
    /// - `PALAVER_SYSTEM_PROMPT`
    /// - `PALAVER_MAX_ITERATIONS`
    /// - `PALAVER_MAX_CONTEXT_TOKENS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::read(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".palaver")
    }

    fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(prompt) = lookup("PALAVER_SYSTEM_PROMPT") {
            self.agent.system_prompt = prompt;
        }
        if let Some(raw) = lookup("PALAVER_MAX_ITERATIONS") {
            self.agent.max_iterations = parse_env("PALAVER_MAX_ITERATIONS", &raw)?;
        }
        if let Some(raw) = lookup("PALAVER_MAX_CONTEXT_TOKENS") {
            self.context.max_context_tokens = parse_env("PALAVER_MAX_CONTEXT_TOKENS", &raw)?;
        }
        Ok(())
    }

    /// Validate the configuration, logging a warning for each foot-gun.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.idle_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.idle_poll_interval_ms must be > 0".into(),
            ));
        }

        if self.reset.summary_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "reset.summary_timeout_secs must be > 0".into(),
            ));
        }

        if self.context.summary_max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "context.summary_max_tokens must be > 0".into(),
            ));
        }

        if self.reset.command.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "reset.command must not be blank".into(),
            ));
        }

        for warning in self.warnings() {
            tracing::warn!("{warning}");
        }
        Ok(())
    }

    /// Settings that are accepted but silently reinterpreted at runtime.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.context.max_context_tokens > 0 && self.context.recent_message_count == 0 {
            warnings.push(
                "context.recent_message_count = 0 keeps every message, so compaction can never shrink the history"
                    .to_string(),
            );
        }
        if self.dispatcher.queue_capacity == 0 {
            warnings.push("dispatcher.queue_capacity = 0 is treated as 1".to_string());
        }
        if self.agent.max_iterations == 0 {
            warnings.push("agent.max_iterations = 0 falls back to 10".to_string());
        }
        warnings
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::EnvError {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Invalid value in {var}: {reason}")]
    EnvError { var: String, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
