// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
mod cli;
mod output;

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use gro_config::{Config, OutputFormat, PersistentPolicy};
use gro_core::{
    learn_file, load_session, pages_dir, sessions_dir, state_root, DriverSummarizer,
    PageSearchTool, RuntimeState, Scheduler, SchedulerConfig, SessionMeta, SessionStatus,
    ToolOrigin, ToolRegistry,
};
use gro_memory::{BatchConfig, MemoryParams, PageStore, SummaryMode, VirtualMemory};
use gro_model::{cancel_pair, tiers, ChatDriver, ChatMessage, source};

use cli::{Cli, FormatArg, PolicyArg};
use output::OutputWriter;

const DEFAULT_SYSTEM_PROMPT: &str = "You are gro, an autonomous agent. Use the available tools \
     to accomplish the task. Inline directives (@@...@@) control your runtime: memory paging, \
     thinking budget, sampling, and model selection.";

fn exit_code(status: SessionStatus) -> i32 {
    match status {
        SessionStatus::Completed | SessionStatus::Aborted => 0,
        SessionStatus::BudgetExhausted => 2,
        SessionStatus::IdleTimeout => 3,
    }
}

fn main() {
    let code = match run() {
        Ok(status) => {
            match status {
                SessionStatus::BudgetExhausted => {
                    eprintln!("gro: budget exhausted; stopping before the next request");
                }
                SessionStatus::IdleTimeout => {
                    eprintln!("gro: idle timeout; the agent produced no work");
                }
                _ => {}
            }
            exit_code(status)
        }
        Err(e) => {
            eprintln!("gro: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

#[tokio::main]
async fn run() -> anyhow::Result<SessionStatus> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let config = merge_config(gro_config::load(args.config.as_deref())?, &args);

    let work_dir = std::env::current_dir().context("resolving working directory")?;
    let root = state_root(&work_dir);
    let sessions = sessions_dir(&root);
    let pages = pages_dir(&root);
    let learn_path = learn_file(&root);

    // ── Drivers ──────────────────────────────────────────────────────────────
    let mut drivers: HashMap<String, Arc<dyn ChatDriver>> = HashMap::new();
    let active = gro_model::from_config(&config.model)?;
    drivers.insert(config.model.provider.clone(), Arc::from(active));
    for provider in &config.providers {
        if drivers.contains_key(provider) {
            continue;
        }
        let cfg = gro_config::ModelConfig {
            provider: provider.clone(),
            name: tiers::default_model(provider, tiers::Tier::Mid)
                .unwrap_or("unknown")
                .to_string(),
            api_key: None,
            base_url: None,
        };
        match gro_model::from_config(&cfg) {
            Ok(driver) => {
                drivers.insert(provider.clone(), Arc::from(driver));
            }
            Err(e) => warn!(provider = %provider, error = %e, "skipping provider"),
        }
    }

    // ── Memory ───────────────────────────────────────────────────────────────
    let store = Arc::new(Mutex::new(PageStore::open(&pages)?));
    let (cancel_handle, cancel) = cancel_pair();

    let mode = if config.agent.batch_summarization {
        let batch_cfg = BatchConfig::new(
            root.join(gro_memory::QUEUE_FILE),
            tiers::default_model(&config.model.provider, tiers::Tier::Low)
                .unwrap_or(&config.model.name)
                .to_string(),
        );
        let (tx, _worker) = gro_memory::batch::spawn(
            batch_cfg,
            Arc::downgrade(&store),
            cancel.clone(),
        );
        SummaryMode::Batch(tx)
    } else {
        // GRO_MEMORY selects the summary implementation; read at startup,
        // swappable later via @@ctrl:memory=...@@.
        match std::env::var("GRO_MEMORY").as_deref() {
            Ok("fragmentation") => SummaryMode::Fragmentation,
            _ => SummaryMode::Synchronous(Arc::new(DriverSummarizer::new(Arc::clone(
                drivers
                    .get(&config.model.provider)
                    .expect("active driver registered above"),
            )))),
        }
    };

    let params = MemoryParams {
        budget_tokens: config.agent.context_tokens,
        ..MemoryParams::default()
    };
    let mut memory = VirtualMemory::new(params, Arc::clone(&store), mode);

    // ── Session ──────────────────────────────────────────────────────────────
    let resumed = if let Some(id) = &args.resume_session {
        Some(load_session(&sessions, id)?)
    } else if args.continue_session {
        match gro_core::latest_session(&sessions) {
            Some(meta) => Some(load_session(&sessions, &meta.id)?),
            None => anyhow::bail!("no previous session to continue"),
        }
    } else {
        None
    };
    let meta = match &resumed {
        Some((meta, messages)) => {
            debug!(id = %meta.id, messages = messages.len(), "resuming session");
            memory.replace_messages(messages.clone());
            meta.clone()
        }
        None => {
            let prompt = config
                .agent
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
            memory
                .add(ChatMessage::system(prompt).with_from(source::SYSTEM))
                .await;
            SessionMeta::new(&config.model.provider, &config.model.name)
        }
    };

    // ── Scheduler ────────────────────────────────────────────────────────────
    let model_pinned = args.model.is_some() || resumed.is_some();
    let state = RuntimeState::new(&config.model.provider, &config.model.name, model_pinned);
    let scheduler_config = SchedulerConfig {
        max_tool_rounds: config.agent.max_tool_rounds,
        max_tokens: config.agent.max_tokens,
        persistent: config.agent.persistent,
        policy: config.agent.persistent_policy,
        max_idle_nudges: config.agent.max_idle_nudges,
        max_budget_usd: config.agent.max_budget_usd,
        enable_caching: config.agent.enable_prompt_caching,
        providers: config.providers.clone(),
        max_tier: config
            .agent
            .max_tier
            .as_deref()
            .map(|s| s.parse::<tiers::Tier>())
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))?,
        session_persistence: config.agent.session_persistence,
        ..SchedulerConfig::default()
    };

    let mut tools = ToolRegistry::new();
    tools.register(
        ToolOrigin::Builtin,
        Arc::new(PageSearchTool::new(Arc::clone(&store))),
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(
        scheduler_config,
        drivers,
        memory,
        Arc::new(tools),
        state,
        meta,
        events_tx,
        cancel.clone(),
    )
    .with_persistence(sessions, learn_path);

    // Ctrl-C cancels the in-flight call; the scheduler saves and exits.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_handle.cancel();
        }
    });

    // Events render live on their own task so streaming output keeps up with
    // the model; the writer comes back for the terminal document.
    let mut writer = OutputWriter::new(config.output_format);
    let consumer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            writer.handle(&event);
        }
        writer
    });

    // ── Run ──────────────────────────────────────────────────────────────────
    let status = if args.interactive {
        run_interactive(&mut scheduler).await?
    } else {
        let prompt = match args.prompt.clone() {
            Some(p) => p,
            None => {
                let mut buffer = String::new();
                std::io::stdin()
                    .read_to_string(&mut buffer)
                    .context("reading prompt from stdin")?;
                buffer.trim().to_string()
            }
        };
        if prompt.is_empty() {
            anyhow::bail!("no prompt given (pass one as an argument, pipe stdin, or use -i)");
        }
        scheduler.run(Some(prompt)).await?
    };

    drop(scheduler); // closes the event channel so the consumer drains out
    if let Ok(mut writer) = consumer.await {
        writer.finish();
    }
    Ok(status)
}

/// Interactive loop: one turn per stdin line; events render through the
/// shared consumer task.
async fn run_interactive(scheduler: &mut Scheduler) -> anyhow::Result<SessionStatus> {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    eprintln!("gro: interactive mode; empty line or EOF exits");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            break;
        }
        let report = scheduler.run_turn(Some(line)).await?;
        if report.status != SessionStatus::Completed {
            return Ok(report.status);
        }
    }
    Ok(SessionStatus::Completed)
}

/// Apply CLI overrides on top of the layered file config.
fn merge_config(mut config: Config, args: &Cli) -> Config {
    if let Some(provider) = &args.provider {
        config.model.provider = provider.clone();
    }
    if let Some(model) = &args.model {
        config.model.name = model.clone();
    }
    if let Some(base_url) = &args.base_url {
        config.model.base_url = Some(base_url.clone());
    }
    if let Some(api_key) = &args.api_key {
        config.model.api_key = Some(api_key.clone());
    }
    if let Some(prompt) = &args.system_prompt {
        config.agent.system_prompt = Some(prompt.clone());
    }
    if let Some(tokens) = args.context_tokens {
        config.agent.context_tokens = tokens;
    }
    if let Some(tokens) = args.max_tokens {
        config.agent.max_tokens = tokens;
    }
    if let Some(rounds) = args.max_tool_rounds {
        config.agent.max_tool_rounds = rounds;
    }
    if args.persistent {
        config.agent.persistent = true;
    }
    if let Some(policy) = args.persistent_policy {
        config.agent.persistent_policy = match policy {
            PolicyArg::ListenOnly => PersistentPolicy::ListenOnly,
            PolicyArg::WorkFirst => PersistentPolicy::WorkFirst,
        };
    }
    if let Some(nudges) = args.max_idle_nudges {
        config.agent.max_idle_nudges = nudges;
    }
    if let Some(format) = args.output_format {
        config.output_format = match format {
            FormatArg::Text => OutputFormat::Text,
            FormatArg::Json => OutputFormat::Json,
            FormatArg::StreamJson => OutputFormat::StreamJson,
        };
    }
    if args.no_session_persistence {
        config.agent.session_persistence = false;
    }
    if args.no_prompt_caching {
        config.agent.enable_prompt_caching = false;
    }
    if args.batch_summarization {
        config.agent.batch_summarization = true;
    }
    if let Some(budget) = args.max_budget_usd {
        config.agent.max_budget_usd = Some(budget);
    }
    if let Some(tier) = &args.max_tier {
        config.agent.max_tier = Some(tier.clone());
    }
    if let Some(providers) = &args.providers {
        config.providers = providers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    config
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(exit_code(SessionStatus::Completed), 0);
        assert_eq!(exit_code(SessionStatus::BudgetExhausted), 2);
        assert_eq!(exit_code(SessionStatus::IdleTimeout), 3);
    }

    #[test]
    fn cli_overrides_win_over_file_config() {
        let args = Cli::parse_from([
            "gro",
            "hi",
            "--provider",
            "google",
            "--model",
            "gemini-2.5-pro",
            "--max-budget-usd",
            "1.0",
            "--providers",
            "google,anthropic",
            "--no-prompt-caching",
        ]);
        let config = merge_config(Config::default(), &args);
        assert_eq!(config.model.provider, "google");
        assert_eq!(config.model.name, "gemini-2.5-pro");
        assert_eq!(config.agent.max_budget_usd, Some(1.0));
        assert_eq!(config.providers, vec!["google", "anthropic"]);
        assert!(!config.agent.enable_prompt_caching);
    }

    #[test]
    fn output_format_override() {
        let args = Cli::parse_from(["gro", "hi", "--output-format", "json"]);
        let config = merge_config(Config::default(), &args);
        assert_eq!(config.output_format, OutputFormat::Json);
    }
}
