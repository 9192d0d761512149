// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The turn scheduler.
//!
//! One turn: refresh sensory sections, auto-fill pages, pick the effective
//! model, stream a completion, run the directive parser over the final text,
//! dispatch tool calls sequentially, and repeat until the model stops
//! calling tools or the round budget runs out.  Persistent mode layers the
//! work/listen fairness contract and the idle policy on top.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gro_config::PersistentPolicy;
use gro_memory::{Page, SummaryChat, SummaryMode, VirtualMemory};
use gro_model::{
    collect_output, rate_limit::RateLimiter, recovery::with_connection_recovery, source, tiers,
    tiers::Tier, CancelSignal, ChatDriver, ChatMessage, ChatRequest, Role, StreamEvent, Usage,
};

use crate::directive::{self, Directive};
use crate::events::AgentEvent;
use crate::learn;
use crate::sensors::{DejaVu, Familiarity};
use crate::session::{save_session, SessionMeta};
use crate::state::RuntimeState;
use crate::tools::{is_listen_tool, ToolRegistry};

// ─── Cost metering ───────────────────────────────────────────────────────────

/// USD per million tokens.  The cache-read discount is subtracted per cached
/// input token (cached reads bill at ~10% of the input rate).
#[derive(Debug, Clone)]
pub struct CostRates {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_discount_per_mtok: f64,
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cache_read_discount_per_mtok: 2.7,
        }
    }
}

#[derive(Debug, Default)]
pub struct CostMeter {
    rates: CostRates,
    pub total_usd: f64,
}

impl CostMeter {
    pub fn new(rates: CostRates) -> Self {
        Self {
            rates,
            total_usd: 0.0,
        }
    }

    pub fn add(&mut self, usage: &Usage) {
        let cost = (usage.input_tokens as f64 * self.rates.input_per_mtok
            + usage.output_tokens as f64 * self.rates.output_per_mtok
            - usage.cache_read_tokens as f64 * self.rates.cache_read_discount_per_mtok)
            / 1_000_000.0;
        self.total_usd += cost.max(0.0);
    }
}

// ─── Scheduler types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Completed,
    BudgetExhausted,
    IdleTimeout,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_tool_rounds: u32,
    pub max_tokens: u32,
    pub persistent: bool,
    pub policy: PersistentPolicy,
    pub max_idle_nudges: u32,
    pub max_budget_usd: Option<f64>,
    pub enable_caching: bool,
    /// Provider preference list for tier selection.
    pub providers: Vec<String>,
    pub max_tier: Option<Tier>,
    pub session_persistence: bool,
    /// Completion-request rate per provider lane.
    pub requests_per_second: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 24,
            max_tokens: 8192,
            persistent: false,
            policy: PersistentPolicy::WorkFirst,
            max_idle_nudges: 3,
            max_budget_usd: None,
            enable_caching: true,
            providers: vec!["anthropic".into(), "openai".into(), "google".into()],
            max_tier: None,
            session_persistence: true,
            requests_per_second: 10.0,
        }
    }
}

#[derive(Debug)]
pub struct TurnReport {
    pub status: SessionStatus,
    /// Final assistant text with directives stripped.
    pub text: String,
    pub rounds: u32,
    pub any_tool_calls: bool,
    pub slept: bool,
}

const WORK_FIRST_NUDGE: &str = "Cooperative contract: alternate short idle checks with real \
     work; do not spam the listen tool. Pick up a concrete task now or emit @@sleep@@.";

/// Accumulated effects of one round's directives.
#[derive(Default)]
struct DirectiveEffects {
    importance: Option<f32>,
    slept: bool,
    force_compact: bool,
}

pub struct Scheduler {
    config: SchedulerConfig,
    drivers: HashMap<String, Arc<dyn ChatDriver>>,
    memory: VirtualMemory,
    tools: Arc<ToolRegistry>,
    pub state: RuntimeState,
    pub meta: SessionMeta,
    dejavu: DejaVu,
    familiarity: Familiarity,
    meter: CostMeter,
    rate: RateLimiter,
    events: mpsc::UnboundedSender<AgentEvent>,
    cancel: CancelSignal,
    sessions_dir: Option<PathBuf>,
    learn_path: Option<PathBuf>,
    turn: u64,
    sleeping: bool,
    idle_streak: u32,
    /// `(tool name, consecutive count)` across rounds and turns.
    tool_streak: Option<(String, u32)>,
    fairness_nudged: bool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        drivers: HashMap<String, Arc<dyn ChatDriver>>,
        memory: VirtualMemory,
        tools: Arc<ToolRegistry>,
        state: RuntimeState,
        meta: SessionMeta,
        events: mpsc::UnboundedSender<AgentEvent>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            config,
            drivers,
            memory,
            tools,
            state,
            meta,
            dejavu: DejaVu::default(),
            familiarity: Familiarity::default(),
            meter: CostMeter::new(CostRates::default()),
            rate: RateLimiter::new(),
            events,
            cancel,
            sessions_dir: None,
            learn_path: None,
            turn: 0,
            sleeping: false,
            idle_streak: 0,
            tool_streak: None,
            fairness_nudged: false,
        }
    }

    /// Enable on-disk persistence (session saves + learned facts).
    pub fn with_persistence(mut self, sessions_dir: PathBuf, learn_path: PathBuf) -> Self {
        self.sessions_dir = Some(sessions_dir);
        self.learn_path = Some(learn_path);
        self
    }

    pub fn memory(&self) -> &VirtualMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut VirtualMemory {
        &mut self.memory
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.meter.total_usd
    }

    /// Seed history (session resume) without running a turn.
    pub fn seed_history(&mut self, messages: Vec<ChatMessage>) {
        self.memory.replace_messages(messages);
    }

    // ── Model selection ───────────────────────────────────────────────────────

    /// Pinned model wins; otherwise the thinking budget picks a tier across
    /// the provider preference list (restricted to providers we actually
    /// have drivers for).
    fn effective_model(&mut self) -> (String, String) {
        if let Some(alias) = self.state.take_model_change() {
            if let Some((provider, model)) = alias.split_once('/') {
                self.state.provider = provider.to_string();
                self.state.model = model.to_string();
            } else {
                self.state.model = alias;
            }
            self.state.model_pinned = true;
            debug!(model = %self.state.model, "model switch applied");
        }
        if self.state.model_pinned {
            return (self.state.provider.clone(), self.state.model.clone());
        }
        let available: Vec<String> = self
            .config
            .providers
            .iter()
            .filter(|p| self.drivers.contains_key(*p))
            .cloned()
            .collect();
        tiers::select_model(&available, self.state.thinking_budget, self.config.max_tier)
            .unwrap_or_else(|| (self.state.provider.clone(), self.state.model.clone()))
    }

    // ── Sensory buffer ────────────────────────────────────────────────────────

    /// Per-turn system-prompt sections: time, context map, familiarity,
    /// deja-vu warnings.  Rebuilt fresh each round, never stored.
    fn sensory_sections(&self) -> Vec<ChatMessage> {
        let mut sections = Vec::new();
        sections.push(
            ChatMessage::system(format!("Time: {}", Utc::now().to_rfc3339()))
                .with_from(source::SENSORY),
        );
        let store_pages = self.memory.store().lock().map(|s| s.len()).unwrap_or(0);
        sections.push(
            ChatMessage::system(format!(
                "Context: {} / {} working-memory tokens; {} pages on disk; {} loaded",
                self.memory.usage_tokens(),
                self.memory.budget_tokens(),
                store_pages,
                self.memory.loaded_pages().len(),
            ))
            .with_from(source::SENSORY),
        );
        let familiar = self.familiarity.top(5);
        if !familiar.is_empty() {
            let lines: Vec<String> = familiar
                .into_iter()
                .map(|(name, score)| format!("  {name}: {score:.2}"))
                .collect();
            sections.push(
                ChatMessage::system(format!("Familiar resources:\n{}", lines.join("\n")))
                    .with_from(source::SENSORY),
            );
        }
        let warnings = self.dejavu.warnings();
        if !warnings.is_empty() {
            sections.push(
                ChatMessage::system(warnings.into_iter().take(5).collect::<Vec<_>>().join("\n"))
                    .with_from(source::SENSORY),
            );
        }
        sections
    }

    // ── Turn loop ─────────────────────────────────────────────────────────────

    pub async fn run_turn(&mut self, user_input: Option<String>) -> anyhow::Result<TurnReport> {
        self.turn += 1;
        self.memory.begin_turn();
        if let Some(input) = user_input {
            let pages = self.memory.add(ChatMessage::user(input)).await;
            self.emit_compaction(pages);
        }

        let mut rounds = 0u32;
        let mut any_tool_calls = false;
        let mut slept = false;
        let mut final_text = String::new();

        let status = loop {
            if self.cancel.is_cancelled() {
                break SessionStatus::Aborted;
            }
            if let Some(budget) = self.config.max_budget_usd {
                if self.meter.total_usd >= budget {
                    break SessionStatus::BudgetExhausted;
                }
            }
            rounds += 1;

            let (provider, model) = self.effective_model();
            let driver = self
                .drivers
                .get(&provider)
                .cloned()
                .with_context(|| format!("no driver for provider {provider:?}"))?;
            // One lane per provider keeps concurrent sessions fair.
            self.rate
                .limit(driver.name(), self.config.requests_per_second)
                .await
                .map_err(anyhow::Error::from)?;
            self.state.provider = provider;
            self.state.model = model.clone();

            let req = self.compose_request(model);
            let output = {
                let events = self.events.clone();
                let cancel = self.cancel.clone();
                let result = with_connection_recovery(
                    || {
                        let driver = Arc::clone(&driver);
                        let req = req.clone();
                        let events = events.clone();
                        let cancel = cancel.clone();
                        async move {
                            let stream = driver.chat(req).await?;
                            collect_output(stream, |ev| forward_event(&events, ev), &cancel).await
                        }
                    },
                    &self.cancel,
                )
                .await;
                match result {
                    Ok(output) => output,
                    Err(e) if e.is_aborted() => break SessionStatus::Aborted,
                    Err(e) => return Err(e.into()),
                }
            };

            self.meter.add(&output.usage);
            let _ = self.events.send(AgentEvent::UsageReport {
                usage: output.usage,
                total_usd: self.meter.total_usd,
            });

            // Directives run over the whole final text, in the fixed order.
            let parsed = directive::parse(&output.text);
            let mut effects = DirectiveEffects::default();
            for d in directive::apply_order(parsed.directives) {
                self.execute_directive(d, &mut effects);
            }
            if effects.slept {
                slept = true;
                self.sleeping = true;
            }
            if effects.force_compact {
                let pages = self.memory.compact().await;
                self.emit_compaction(pages);
            }
            final_text = parsed.cleaned.clone();

            // The cleaned text is what gets persisted.
            if !parsed.cleaned.trim().is_empty() || !output.tool_calls.is_empty() {
                let mut message =
                    ChatMessage::assistant_with_calls(parsed.cleaned, output.tool_calls.clone());
                message.reasoning = output.reasoning.clone();
                message.importance = effects.importance;
                let pages = self.memory.add(message).await;
                self.emit_compaction(pages);
            }

            if output.tool_calls.is_empty() {
                break SessionStatus::Completed;
            }
            any_tool_calls = true;

            // Tools execute sequentially in the order the model emitted them.
            for call in &output.tool_calls {
                let _ = self.events.send(AgentEvent::ToolCallStarted {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                let outcome = self.tools.execute(call).await;
                self.dejavu
                    .record(&call.name, &call.arguments, &outcome.content, self.turn);
                self.familiarity.access(&format!("tool:{}", call.name));
                if !is_listen_tool(&call.name) {
                    self.sleeping = false; // auto-wake on real work
                }
                let pages = self
                    .memory
                    .add(ChatMessage::tool_result(
                        call.id.clone(),
                        call.name.clone(),
                        outcome.content.clone(),
                    ))
                    .await;
                self.emit_compaction(pages);
                let _ = self.events.send(AgentEvent::ToolCallFinished {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output: outcome.content,
                    is_error: outcome.is_error,
                });
                // The correction lands after the result so call/result pairs
                // stay adjacent for the drivers.
                if let Some(nudge) = self.track_tool_streak(&call.name) {
                    let _ = self.events.send(AgentEvent::Nudge(nudge.clone()));
                    // Untagged system message: visible immediately, still
                    // eligible for compaction later.
                    let pages = self.memory.add(ChatMessage::system(nudge)).await;
                    self.emit_compaction(pages);
                }
            }

            if rounds >= self.config.max_tool_rounds {
                break SessionStatus::Completed;
            }
        };

        self.familiarity.decay_turn();
        self.save()?;
        let _ = self.events.send(AgentEvent::TurnComplete {
            text: final_text.clone(),
        });
        Ok(TurnReport {
            status,
            text: final_text,
            rounds,
            any_tool_calls,
            slept,
        })
    }

    /// Persistent-mode driver: turns continue until cancellation, budget
    /// exhaustion, or idle timeout.
    pub async fn run(&mut self, initial_input: Option<String>) -> anyhow::Result<SessionStatus> {
        let mut input = initial_input;
        loop {
            let report = self.run_turn(input.take()).await?;
            if report.status != SessionStatus::Completed {
                return Ok(report.status);
            }
            if !self.config.persistent {
                return Ok(SessionStatus::Completed);
            }

            if !report.any_tool_calls && !self.sleeping {
                self.idle_streak += 1;
                if self.idle_streak >= self.config.max_idle_nudges {
                    return Ok(SessionStatus::IdleTimeout);
                }
                if self.config.policy == PersistentPolicy::WorkFirst {
                    let _ = self
                        .events
                        .send(AgentEvent::Nudge(WORK_FIRST_NUDGE.to_string()));
                    let pages = self.memory.add(ChatMessage::system(WORK_FIRST_NUDGE)).await;
                    self.emit_compaction(pages);
                }
            } else {
                self.idle_streak = 0;
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn compose_request(&mut self, model: String) -> ChatRequest {
        let mut messages = self.memory.snapshot();
        let mut extras = self.memory.auto_fill();
        extras.extend(self.sensory_sections());
        let insert_at = messages
            .iter()
            .position(|m| m.role != Role::System)
            .unwrap_or(messages.len());
        for (offset, msg) in extras.into_iter().enumerate() {
            messages.insert(insert_at + offset, msg);
        }
        ChatRequest {
            messages,
            tools: self.tools.schemas(),
            model: Some(model),
            max_tokens: self.config.max_tokens,
            sampling: self.state.sampling(),
            thinking_budget: self.state.thinking_budget,
            enable_caching: self.config.enable_caching,
            cancel: self.cancel.clone(),
        }
    }

    fn execute_directive(&mut self, directive: Directive, effects: &mut DirectiveEffects) {
        let result: anyhow::Result<()> = (|| {
            match directive {
                Directive::Learn(fact) => {
                    // GRO_PLASTIC=0 disables persisting learned facts; read
                    // per call so live overrides take effect.
                    let plastic = std::env::var("GRO_PLASTIC")
                        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                        .unwrap_or(true);
                    if plastic {
                        if let Some(path) = &self.learn_path {
                            learn::append_fact(path, &fact)?;
                        }
                    }
                    self.patch_system_prompt(&fact);
                }
                Directive::MemorySwap(kind) => {
                    if kind == "fragmentation" {
                        self.memory.set_mode(SummaryMode::Fragmentation);
                    } else {
                        warn!(kind = %kind, "memory swap target needs session resources; recorded only");
                    }
                    self.state.set_memory_kind(kind);
                }
                Directive::ModelChange(alias) => self.state.request_model(alias),
                Directive::ThinkingSet(x) => self.state.set_thinking(x),
                Directive::ThinkingUp => self.state.thinking_up(),
                Directive::ThinkingDown => self.state.thinking_down(),
                Directive::Temperature(x) => self.state.set_temperature(x),
                Directive::TopP(x) => self.state.set_top_p(x),
                Directive::TopK(k) => self.state.set_top_k(k),
                Directive::Ref(ids) => self.memory.request_pages(&ids),
                Directive::RefQuery(query) => self.memory.request_query(query),
                Directive::Unref(id) => self.memory.release_page(&id),
                Directive::Importance(x) => effects.importance = Some(x.clamp(0.0, 1.0)),
                Directive::MaxContext(tokens) => self.memory.set_budget_tokens(tokens),
                Directive::CompactContext => effects.force_compact = true,
                Directive::Sleep => effects.slept = true,
                Directive::Wake => self.sleeping = false,
                Directive::Sense { channel, on } => {
                    debug!(channel = %channel, on, "sensory channel toggled");
                }
                Directive::View { channel, slot } => {
                    debug!(channel = %channel, ?slot, "view requested");
                }
                Directive::Emotion(pairs) => {
                    debug!(signal = ?pairs, "emotion signal recorded");
                }
            }
            Ok(())
        })();
        // Directive failures are logged, never abort the turn.
        if let Err(e) = result {
            warn!(error = %e, "directive execution failed");
        }
    }

    /// Hot-patch the static system prompt with a learned fact.
    fn patch_system_prompt(&mut self, fact: &str) {
        let mut messages = self.memory.snapshot();
        let mut patched = false;
        if let Some(prompt) = messages
            .iter_mut()
            .find(|m| m.role == Role::System && m.from_tag() == Some(source::SYSTEM))
        {
            prompt.content.push_str(&format!("\nLearned: {fact}"));
            patched = true;
        }
        if patched {
            self.memory.replace_messages(messages);
        }
    }

    /// Track consecutive calls to the same tool; at three in a row the
    /// work-first policy injects a fairness correction (once per streak).
    fn track_tool_streak(&mut self, name: &str) -> Option<String> {
        let count = match &mut self.tool_streak {
            Some((current, count)) if current == name => {
                *count += 1;
                *count
            }
            _ => {
                self.tool_streak = Some((name.to_string(), 1));
                self.fairness_nudged = false;
                1
            }
        };
        let work_first =
            self.config.persistent && self.config.policy == PersistentPolicy::WorkFirst;
        if work_first && count >= 3 && !self.fairness_nudged {
            self.fairness_nudged = true;
            return Some(format!(
                "you called {name} {count} times without doing work; do a work slice now"
            ));
        }
        None
    }

    fn emit_compaction(&self, pages: Vec<Page>) {
        if pages.is_empty() {
            return;
        }
        let _ = self.events.send(AgentEvent::Compacted {
            page_ids: pages.into_iter().map(|p| p.id).collect(),
        });
    }

    fn save(&mut self) -> anyhow::Result<()> {
        if !self.config.session_persistence {
            return Ok(());
        }
        let Some(dir) = &self.sessions_dir else {
            return Ok(());
        };
        self.meta.updated_at = Utc::now();
        self.meta.provider = self.state.provider.clone();
        self.meta.model = self.state.model.clone();
        save_session(dir, &self.meta, &self.memory.snapshot())
            .context("saving session after turn")
    }
}

fn forward_event(events: &mpsc::UnboundedSender<AgentEvent>, event: &StreamEvent) {
    match event {
        StreamEvent::TextDelta(t) if !t.is_empty() => {
            let _ = events.send(AgentEvent::TextDelta(t.clone()));
        }
        StreamEvent::ReasoningDelta(t) if !t.is_empty() => {
            let _ = events.send(AgentEvent::ReasoningDelta(t.clone()));
        }
        _ => {}
    }
}

/// Adapter giving the memory system its single-method view of a driver.
pub struct DriverSummarizer {
    driver: Arc<dyn ChatDriver>,
}

impl DriverSummarizer {
    pub fn new(driver: Arc<dyn ChatDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl SummaryChat for DriverSummarizer {
    async fn chat(&self, prompt: String) -> anyhow::Result<String> {
        let req = ChatRequest {
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: 512,
            enable_caching: false,
            ..ChatRequest::default()
        };
        let stream = self.driver.chat(req).await?;
        let output = collect_output(stream, |_| {}, &CancelSignal::never()).await?;
        Ok(output.text)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
