// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Text,
    Json,
    StreamJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    ListenOnly,
    WorkFirst,
}

/// A provider-agnostic runtime for LLM agents with virtual working memory.
#[derive(Debug, Parser)]
#[command(name = "gro", version, about)]
pub struct Cli {
    /// The prompt to run.  Omitted: read from stdin (or use -i).
    pub prompt: Option<String>,

    /// Interactive mode: read prompts from stdin line by line.
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Print-once mode: one completion, then exit.
    #[arg(short = 'p', long)]
    pub print: bool,

    /// Provider id: anthropic | openai | google | mock.
    #[arg(long)]
    pub provider: Option<String>,

    /// Model name; pins the model for the session (disables tier selection).
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Base URL override for proxies and compatible gateways.
    #[arg(long)]
    pub base_url: Option<String>,

    /// Explicit API key (prefer the provider env var).
    #[arg(long)]
    pub api_key: Option<String>,

    /// Static system prompt.
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Working-memory token budget.
    #[arg(long)]
    pub context_tokens: Option<usize>,

    /// Maximum output tokens per completion.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Completion/tool rounds allowed inside one turn.
    #[arg(long)]
    pub max_tool_rounds: Option<u32>,

    /// Keep running past a single turn until cancelled or idle-timed-out.
    #[arg(long)]
    pub persistent: bool,

    #[arg(long, value_enum)]
    pub persistent_policy: Option<PolicyArg>,

    /// Consecutive idle turns tolerated in persistent mode.
    #[arg(long)]
    pub max_idle_nudges: Option<u32>,

    #[arg(long, value_enum)]
    pub output_format: Option<FormatArg>,

    /// Continue the most recent session.
    #[arg(long = "continue")]
    pub continue_session: bool,

    /// Resume a specific session by id.
    #[arg(long = "resume")]
    pub resume_session: Option<String>,

    /// Disable per-turn session saves.
    #[arg(long)]
    pub no_session_persistence: bool,

    /// Disable provider prompt-cache hints.
    #[arg(long)]
    pub no_prompt_caching: bool,

    /// Summarize compacted pages through the provider batch endpoint.
    #[arg(long)]
    pub batch_summarization: bool,

    /// Abort with exit code 2 once the cost meter reaches this.
    #[arg(long)]
    pub max_budget_usd: Option<f64>,

    /// Tier ceiling for thinking-budget model selection: low | mid | high.
    #[arg(long)]
    pub max_tier: Option<String>,

    /// Comma-separated provider preference list for tier selection.
    #[arg(long)]
    pub providers: Option<String>,

    /// Explicit config file (also honoured via GRO_CONFIG_FILE).
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_and_flags_parse() {
        let cli = Cli::parse_from([
            "gro",
            "summarize the repo",
            "--provider",
            "anthropic",
            "-m",
            "claude-opus-4-5",
            "--max-tool-rounds",
            "8",
            "--output-format",
            "stream-json",
        ]);
        assert_eq!(cli.prompt.as_deref(), Some("summarize the repo"));
        assert_eq!(cli.provider.as_deref(), Some("anthropic"));
        assert_eq!(cli.model.as_deref(), Some("claude-opus-4-5"));
        assert_eq!(cli.max_tool_rounds, Some(8));
        assert_eq!(cli.output_format, Some(FormatArg::StreamJson));
    }

    #[test]
    fn continue_and_resume_flags() {
        let cli = Cli::parse_from(["gro", "--continue"]);
        assert!(cli.continue_session);
        let cli = Cli::parse_from(["gro", "--resume", "ab12cd34"]);
        assert_eq!(cli.resume_session.as_deref(), Some("ab12cd34"));
    }

    #[test]
    fn persistent_mode_flags() {
        let cli = Cli::parse_from([
            "gro",
            "-i",
            "--persistent",
            "--persistent-policy",
            "work-first",
            "--max-idle-nudges",
            "5",
        ]);
        assert!(cli.interactive);
        assert!(cli.persistent);
        assert_eq!(cli.persistent_policy, Some(PolicyArg::WorkFirst));
        assert_eq!(cli.max_idle_nudges, Some(5));
    }

    #[test]
    fn budget_flag_parses() {
        let cli = Cli::parse_from(["gro", "-p", "hi", "--max-budget-usd", "2.5"]);
        assert!(cli.print);
        assert_eq!(cli.max_budget_usd, Some(2.5));
    }
}
