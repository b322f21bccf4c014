// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless the user
/// explicitly opts out need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub edit: EditConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
}

impl Config {
    /// Apply `CODEPUNK_*` environment overrides on top of the loaded file.
    ///
    /// Called by [`crate::load`]; exposed so tests can drive it with a
    /// pre-built config.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CODEPUNK_MAX_FILE_SIZE") {
            match v.parse::<u64>() {
                Ok(bytes) => self.edit.max_file_size = bytes,
                Err(_) => {
                    tracing::warn!(value = %v, "ignoring non-numeric CODEPUNK_MAX_FILE_SIZE")
                }
            }
        }
        if env_flag("CODEPUNK_COMPACT_TOOLS") {
            self.tools.compact_descriptions = true;
        }
        if let Ok(v) = std::env::var("CODEPUNK_PROMPT_COMPOSE") {
            match v.as_str() {
                "provider" => self.prompt.compose = PromptCompose::Provider,
                "base" => self.prompt.compose = PromptCompose::Base,
                "composite" => self.prompt.compose = PromptCompose::Composite,
                other => tracing::warn!(value = %other, "unknown CODEPUNK_PROMPT_COMPOSE value"),
            }
        }
        if let Ok(v) = std::env::var("CODEPUNK_PROMPT_PATHS") {
            self.prompt.paths = std::env::split_paths(&v)
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
        }
        if env_flag("CODEPUNK_KEEP_FAILED_SESSIONS") {
            self.git.keep_failed_sessions = true;
        }
        if env_flag("CODEPUNK_GIT_SESSION_DISABLED") {
            self.git.disabled = true;
        }
    }
}

/// `FLAG=1` is the only truthy spelling the flags accept.
fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier. Currently "anthropic" or "mock".
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env or the auth store in
    /// version-controlled config files.
    pub api_key: Option<String>,
    /// Base URL override. Useful for proxies and gateway deployments.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–1.0).
    pub temperature: Option<f32>,
    /// Attach ephemeral cache-control markers to the system blocks and the
    /// last tool definition so the provider caches the stable prompt prefix.
    #[serde(default = "default_true")]
    pub use_ephemeral_cache: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            use_ephemeral_cache: true,
        }
    }
}

fn default_max_iterations() -> u32 {
    5
}
fn default_tool_timeout_secs() -> u64 {
    120
}

/// Knobs for the tool-calling loop.
///
/// A value of 0 disables the corresponding guardrail (per-iteration cap,
/// repetition cap, error streak); the iteration cap itself is always active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Hard ceiling on model↔tool round trips per user message.
    #[serde(default = "default_max_iterations")]
    pub max_tool_call_iterations: u32,
    /// Maximum tool calls the model may batch into one iteration (0 = unlimited).
    #[serde(default)]
    pub max_tool_calls_per_iteration: u32,
    /// Consecutive iterations repeating an earlier tool-call signature before
    /// the loop is aborted (0 = disabled).
    #[serde(default)]
    pub max_repeated_tool_calls: u32,
    /// Consecutive all-error iterations before the loop is aborted (0 = disabled).
    #[serde(default)]
    pub max_consecutive_tool_errors: u32,
    /// Per-tool execution deadline in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_execution_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_tool_call_iterations: default_max_iterations(),
            max_tool_calls_per_iteration: 0,
            max_repeated_tool_calls: 0,
            max_consecutive_tool_errors: 0,
            tool_execution_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Truncate tool descriptions advertised to the model to the first
    /// sentence (or 140 chars) to reduce prompt token cost.
    /// Also settable via `CODEPUNK_COMPACT_TOOLS=1`.
    #[serde(default)]
    pub compact_descriptions: bool,
}

fn default_max_file_size() -> u64 {
    5 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditConfig {
    /// Largest file the edit service will open, in bytes.
    /// Also settable via `CODEPUNK_MAX_FILE_SIZE`.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Whether file edits go through the approval service by default.
    #[serde(default = "default_true")]
    pub require_approval: bool,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            require_approval: true,
        }
    }
}

fn default_branch_prefix() -> String {
    "ai/session".into()
}
fn default_auto_revert_minutes() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Disable the git shadow-session subsystem entirely.
    /// Also settable via `CODEPUNK_GIT_SESSION_DISABLED=1`.
    #[serde(default)]
    pub disabled: bool,
    /// Branch name prefix for shadow branches: `<prefix>/<session-id>`.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Stash uncommitted work before creating the shadow branch and restore
    /// it on accept/reject.
    #[serde(default = "default_true")]
    pub stash_enabled: bool,
    /// Inactivity window after which an unresolved session is auto-reverted
    /// by startup cleanup.
    #[serde(default = "default_auto_revert_minutes")]
    pub auto_revert_minutes: u64,
    /// Keep the shadow branch of failed sessions for post-mortem inspection
    /// instead of force-deleting it during revert.
    /// Also settable via `CODEPUNK_KEEP_FAILED_SESSIONS=1`.
    #[serde(default)]
    pub keep_failed_sessions: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            branch_prefix: default_branch_prefix(),
            stash_enabled: true,
            auto_revert_minutes: default_auto_revert_minutes(),
            keep_failed_sessions: false,
        }
    }
}

/// How the base and provider system-prompt layers combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptCompose {
    /// Provider-specific prompt only.
    Provider,
    /// Base prompt only.
    Base,
    /// Base prompt followed by the provider layer.
    #[default]
    Composite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub compose: PromptCompose,
    /// Directories searched (in order) for prompt files overriding the
    /// embedded defaults. Also settable via `CODEPUNK_PROMPT_PATHS`
    /// (PATH-separated).
    #[serde(default)]
    pub paths: Vec<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chat_config_matches_documented_defaults() {
        let c = ChatConfig::default();
        assert_eq!(c.max_tool_call_iterations, 5);
        assert_eq!(c.max_tool_calls_per_iteration, 0);
        assert_eq!(c.max_repeated_tool_calls, 0);
        assert_eq!(c.max_consecutive_tool_errors, 0);
        assert_eq!(c.tool_execution_timeout_secs, 120);
    }

    #[test]
    fn default_edit_config_is_five_megabytes() {
        assert_eq!(EditConfig::default().max_file_size, 5 * 1024 * 1024);
    }

    #[test]
    fn default_git_config_uses_ai_session_prefix() {
        let g = GitConfig::default();
        assert_eq!(g.branch_prefix, "ai/session");
        assert!(g.stash_enabled);
        assert_eq!(g.auto_revert_minutes, 30);
        assert!(!g.disabled);
    }

    #[test]
    fn empty_yaml_deserializes_to_defaults() {
        let c: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(c.model.provider, "anthropic");
        assert_eq!(c.chat.max_tool_call_iterations, 5);
    }

    #[test]
    fn partial_yaml_overrides_single_field() {
        let c: Config = serde_yaml::from_str("chat:\n  max_tool_call_iterations: 9\n").unwrap();
        assert_eq!(c.chat.max_tool_call_iterations, 9);
        // Untouched sections keep their defaults.
        assert_eq!(c.chat.tool_execution_timeout_secs, 120);
    }

    #[test]
    fn prompt_compose_parses_lowercase_names() {
        let c: Config = serde_yaml::from_str("prompt:\n  compose: base\n").unwrap();
        assert_eq!(c.prompt.compose, PromptCompose::Base);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let orig = Config::default();
        let yaml = serde_yaml::to_string(&orig).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.model.name, orig.model.name);
        assert_eq!(back.git.branch_prefix, orig.git.branch_prefix);
    }
}
