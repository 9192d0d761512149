// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_max_tool_rounds() -> u32 {
    24
}

fn default_max_idle_nudges() -> u32 {
    3
}

fn default_context_tokens() -> usize {
    120_000
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Text
}

fn default_persistent_policy() -> PersistentPolicy {
    PersistentPolicy::WorkFirst
}

fn default_providers() -> Vec<String> {
    vec![
        "anthropic".to_string(),
        "openai".to_string(),
        "google".to_string(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Text,
    Json,
    StreamJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistentPolicy {
    /// Only listen for external events; no fairness nudges.
    ListenOnly,
    /// Alternate listening with real work; nudge on idle spins.
    WorkFirst,
}

/// Model/provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "openai" | "google" | "mock".
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Explicit API key; prefer the provider env var in config files.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL override for proxies and compatible gateways.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            api_key: None,
            base_url: None,
        }
    }
}

/// Agent behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Static system prompt (the "System"-tagged message).
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Working-memory token budget.
    #[serde(default = "default_context_tokens")]
    pub context_tokens: usize,
    /// Maximum output tokens per completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Completion/tool rounds allowed inside one turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Keep running past a single turn until cancelled or idle-timed-out.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default = "default_persistent_policy")]
    pub persistent_policy: PersistentPolicy,
    /// Consecutive idle turns tolerated in persistent mode.
    #[serde(default = "default_max_idle_nudges")]
    pub max_idle_nudges: u32,
    /// Abort with exit code 2 once the cost meter reaches this.
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    /// Ceiling for thinking-budget tier selection: "low" | "mid" | "high".
    #[serde(default)]
    pub max_tier: Option<String>,
    /// Save the session to disk after every turn.
    #[serde(default = "default_true")]
    pub session_persistence: bool,
    #[serde(default = "default_true")]
    pub enable_prompt_caching: bool,
    /// Summarize compacted pages through the provider batch endpoint.
    #[serde(default)]
    pub batch_summarization: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("defaults deserialize")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Provider preference list for thinking-budget tier selection.
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("defaults deserialize")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
