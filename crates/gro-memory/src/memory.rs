// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Virtual working memory.
//!
//! A bounded in-memory buffer backed by the page store.  When usage crosses
//! the high watermark, older messages are evicted per swimlane into
//! content-addressed pages and replaced by one synthetic reference message
//! per lane.  Pages flow back into the system prompt through the page-slot
//! auto-fill, which the model steers with inline `@@ref(...)@@` directives.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gro_model::{source, ChatMessage, Role};

use crate::batch::SummaryJob;
use crate::page::Page;
use crate::store::PageStore;
use crate::summarize::{
    fragment_summary, placeholder_summary, serialize_messages, summarize_sync, SummaryChat,
};

// ─── Parameters ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryParams {
    /// Working-memory token budget (W).
    pub budget_tokens: usize,
    /// Page-slot token budget (P) for auto-filled pages.
    pub page_slot_tokens: usize,
    /// Per-lane minimum of recent messages that survive compaction.
    pub min_recent_per_lane: usize,
    /// Compaction triggers at `usage >= high_ratio × W`.
    pub high_ratio: f32,
    /// Compaction evicts until `usage <= low_ratio × W`.
    pub low_ratio: f32,
    /// Messages at or above this importance are lifted out of compaction.
    pub importance_keep: f32,
    /// Window count for fragmentation summaries.
    pub fragments: usize,
}

impl Default for MemoryParams {
    fn default() -> Self {
        Self {
            budget_tokens: 120_000,
            page_slot_tokens: 18_000,
            min_recent_per_lane: 2,
            high_ratio: 0.7,
            low_ratio: 0.5,
            importance_keep: 0.7,
            fragments: 3,
        }
    }
}

// ─── Swimlanes ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    User,
    Assistant,
    System,
    Tool,
}

impl Lane {
    pub fn of(message: &ChatMessage) -> Self {
        match message.role {
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
            Role::System => Self::System,
            Role::Tool => Self::Tool,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    const ALL: [Lane; 4] = [Lane::User, Lane::Assistant, Lane::System, Lane::Tool];
}

// ─── Summary mode ────────────────────────────────────────────────────────────

pub enum SummaryMode {
    /// Call a small model inline; blocks the add (bounded by a timeout).
    Synchronous(Arc<dyn SummaryChat>),
    /// Insert a placeholder and enqueue for the batch worker.
    Batch(mpsc::Sender<SummaryJob>),
    /// Zero-cost window sampling.
    Fragmentation,
}

// ─── Virtual memory ──────────────────────────────────────────────────────────

pub struct VirtualMemory {
    params: MemoryParams,
    buffer: Vec<ChatMessage>,
    store: Arc<Mutex<PageStore>>,
    mode: SummaryMode,
    /// Pages currently occupying the auto-fill budget.
    loaded: HashSet<String>,
    /// Page id → turn of the most recent explicit ref.
    ref_requests: HashMap<String, u64>,
    /// Pages explicitly released this turn.
    unref: HashSet<String>,
    /// `?query` refs awaiting semantic resolution at the next auto-fill.
    pending_queries: Vec<String>,
    turn: u64,
}

impl VirtualMemory {
    pub fn new(params: MemoryParams, store: Arc<Mutex<PageStore>>, mode: SummaryMode) -> Self {
        Self {
            params,
            buffer: Vec::new(),
            store,
            mode,
            loaded: HashSet::new(),
            ref_requests: HashMap::new(),
            unref: HashSet::new(),
            pending_queries: Vec::new(),
            turn: 0,
        }
    }

    pub fn params(&self) -> &MemoryParams {
        &self.params
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.buffer
    }

    /// Shallow copy for disk saves; the scheduler remains the only mutator.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.buffer.clone()
    }

    pub fn replace_messages(&mut self, messages: Vec<ChatMessage>) {
        self.buffer = messages;
    }

    pub fn store(&self) -> Arc<Mutex<PageStore>> {
        Arc::clone(&self.store)
    }

    pub fn usage_tokens(&self) -> usize {
        self.buffer.iter().map(|m| m.approx_tokens()).sum()
    }

    pub fn budget_tokens(&self) -> usize {
        self.params.budget_tokens
    }

    /// Adjust the working-memory budget (the `max-context` directive).
    pub fn set_budget_tokens(&mut self, tokens: usize) {
        self.params.budget_tokens = tokens.max(1024);
    }

    /// Advance the turn counter (ref-recency decay base).
    pub fn begin_turn(&mut self) {
        self.turn += 1;
    }

    /// Swap the summary implementation at runtime (`ctrl:memory=...`).
    pub fn set_mode(&mut self, mode: SummaryMode) {
        self.mode = mode;
    }

    // ── Add & compaction ──────────────────────────────────────────────────────

    /// Append a message; compacts synchronously when the high watermark is
    /// crossed.  Returns the pages created, if any.
    pub async fn add(&mut self, message: ChatMessage) -> Vec<Page> {
        self.buffer.push(message);
        let high = (self.params.high_ratio * self.params.budget_tokens as f32) as usize;
        if self.usage_tokens() >= high {
            self.compact().await
        } else {
            Vec::new()
        }
    }

    /// Evict per-lane until usage drops below the low watermark, producing
    /// one page per non-empty lane accumulator.
    pub async fn compact(&mut self) -> Vec<Page> {
        self.store.lock().expect("store lock").flush_dirty();

        let low = (self.params.low_ratio * self.params.budget_tokens as f32) as usize;
        let mut evicted: HashMap<Lane, Vec<ChatMessage>> = HashMap::new();
        let mut lifted: Vec<ChatMessage> = Vec::new();

        while self.usage_tokens() > low {
            let Some(index) = self.pick_eviction_index() else {
                break;
            };
            let message = self.buffer.remove(index);
            if message.importance.unwrap_or(0.0) >= self.params.importance_keep {
                lifted.push(message);
            } else {
                evicted.entry(Lane::of(&message)).or_default().push(message);
            }
        }

        let mut pages = Vec::new();
        let mut ref_messages = Vec::new();
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        for lane in Lane::ALL {
            let Some(messages) = evicted.remove(&lane) else {
                continue;
            };
            if messages.is_empty() {
                continue;
            }
            let label = format!("{}@{}", lane.as_str(), stamp);
            let page = self.build_page(&label, lane, &messages).await;
            let id = self.store.lock().expect("store lock").create(page.clone());
            debug!(
                id = %id,
                lane = lane.as_str(),
                messages = messages.len(),
                "compacted lane into page"
            );
            let summary = page.summary.clone().unwrap_or_default();
            ref_messages.push(
                ChatMessage::assistant(format!("[{label}] {summary} @@ref('{id}')@@"))
                    .with_from(source::VIRTUAL_MEMORY),
            );
            pages.push(page);
        }

        // Reference lines take the evicted messages' place near the front;
        // lifted messages rejoin at the tail.
        let insert_at = self
            .buffer
            .iter()
            .position(|m| m.role != Role::System)
            .unwrap_or(self.buffer.len());
        for (offset, msg) in ref_messages.into_iter().enumerate() {
            self.buffer.insert(insert_at + offset, msg);
        }
        self.buffer.extend(lifted);

        pages
    }

    /// Choose the next eviction victim: the oldest message of the lane with
    /// the largest token footprint whose queue still exceeds its floor.
    fn pick_eviction_index(&self) -> Option<usize> {
        let mut lanes: HashMap<Lane, (usize, Vec<usize>)> = HashMap::new();
        for (i, m) in self.buffer.iter().enumerate() {
            if m.role == Role::System && m.from_tag() == Some(source::SYSTEM) {
                continue; // the system prompt is never compacted
            }
            let entry = lanes.entry(Lane::of(m)).or_default();
            entry.0 += m.approx_tokens();
            entry.1.push(i);
        }
        lanes
            .into_iter()
            .filter(|(_, (_, indices))| indices.len() > self.params.min_recent_per_lane)
            .max_by_key(|(lane, (tokens, _))| (*tokens, std::cmp::Reverse(*lane)))
            .map(|(_, (_, indices))| indices[0])
    }

    async fn build_page(&self, label: &str, lane: Lane, messages: &[ChatMessage]) -> Page {
        let max_importance = messages
            .iter()
            .filter_map(|m| m.importance)
            .fold(None, |acc: Option<f32>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            });

        match &self.mode {
            SummaryMode::Fragmentation => {
                // Zero-cost: the sampled windows ARE the body; the summary is
                // the header line.
                let frag = fragment_summary(messages, self.params.fragments);
                let header = frag.lines().next().unwrap_or_default().to_string();
                let mut page = Page::new(
                    label,
                    frag,
                    messages.len(),
                    Some(lane.as_str().to_string()),
                    max_importance,
                );
                page.summary = Some(header);
                page
            }
            SummaryMode::Synchronous(model) => {
                let body = serialize_messages(messages);
                let summary =
                    summarize_sync(model.as_ref(), &body, messages, self.params.fragments).await;
                let mut page = Page::new(
                    label,
                    body,
                    messages.len(),
                    Some(lane.as_str().to_string()),
                    max_importance,
                );
                page.summary = Some(summary);
                page
            }
            SummaryMode::Batch(queue) => {
                let body = serialize_messages(messages);
                let mut page = Page::new(
                    label,
                    body,
                    messages.len(),
                    Some(lane.as_str().to_string()),
                    max_importance,
                );
                page.summary = Some(placeholder_summary(messages.len()));
                let job = SummaryJob {
                    page_id: page.id.clone(),
                    lane: Some(lane.as_str().to_string()),
                    label: label.to_string(),
                    attempts: 0,
                };
                if let Err(e) = queue.try_send(job) {
                    warn!(error = %e, "batch queue full; placeholder summary stays");
                }
                page
            }
        }
    }

    // ── Page-load protocol ────────────────────────────────────────────────────

    /// Record explicit `@@ref(id)@@` requests for the next auto-fill.
    pub fn request_pages(&mut self, ids: &[String]) {
        for id in ids {
            self.unref.remove(id);
            self.ref_requests.insert(id.clone(), self.turn);
        }
    }

    /// Record a `@@ref('?query')@@` semantic request.
    pub fn request_query(&mut self, query: impl Into<String>) {
        self.pending_queries.push(query.into());
    }

    /// Release a page (`@@unref(id)@@`).
    pub fn release_page(&mut self, id: &str) {
        self.unref.insert(id.to_string());
        self.ref_requests.remove(id);
        self.loaded.remove(id);
    }

    pub fn loaded_pages(&self) -> &HashSet<String> {
        &self.loaded
    }

    /// Choose which pages ride along this turn and emit them as system
    /// messages tagged `from=VirtualMemory`.
    ///
    /// Explicit refs load first; the remainder is ranked by ref recency
    /// (decaying), lexical similarity to the recent conversation, and
    /// max-importance, then greedy-packed under the page-slot budget.
    pub fn auto_fill(&mut self) -> Vec<ChatMessage> {
        // Resolve pending semantic queries into refs first.
        let queries: Vec<String> = self.pending_queries.drain(..).collect();
        for q in queries {
            for (id, _) in self.search_semantic(&q).into_iter().take(3) {
                self.unref.remove(&id);
                self.ref_requests.insert(id, self.turn);
            }
        }

        let pages = match self.store.lock().expect("store lock").all() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "page store unreadable during auto-fill");
                Vec::new()
            }
        };
        let by_id: HashMap<&str, &Page> = pages.iter().map(|p| (p.id.as_str(), p)).collect();

        // Explicit refs, most recently requested first.
        let mut explicit: Vec<&Page> = self
            .ref_requests
            .iter()
            .filter(|(id, _)| !self.unref.contains(*id))
            .filter_map(|(id, _)| by_id.get(id.as_str()).copied())
            .collect();
        explicit.sort_by_key(|p| std::cmp::Reverse(self.ref_requests.get(&p.id).copied()));

        // Rank the rest.
        let recent_text: String = self
            .buffer
            .iter()
            .rev()
            .take(6)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let explicit_ids: HashSet<&str> = explicit.iter().map(|p| p.id.as_str()).collect();
        let mut ranked: Vec<(&Page, f32)> = pages
            .iter()
            .filter(|p| !explicit_ids.contains(p.id.as_str()))
            .filter(|p| !self.unref.contains(&p.id))
            .map(|p| {
                let recency = self
                    .ref_requests
                    .get(&p.id)
                    .map(|t| 0.5f32.powi((self.turn.saturating_sub(*t)) as i32))
                    .unwrap_or(0.0);
                let similarity = token_overlap(&recent_text, p.display_summary());
                let importance = p.max_importance.unwrap_or(0.0);
                (p, recency * 2.0 + similarity + importance)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        // Greedy-pack under the page-slot budget.
        let mut budget = self.params.page_slot_tokens;
        let mut out = Vec::new();
        self.loaded.clear();
        for page in explicit
            .into_iter()
            .chain(ranked.into_iter().filter(|(_, s)| *s > 0.0).map(|(p, _)| p))
        {
            if page.tokens > budget {
                continue;
            }
            budget -= page.tokens;
            self.loaded.insert(page.id.clone());
            out.push(
                ChatMessage::system(format!(
                    "[Page {} — {}]\n{}",
                    page.id, page.label, page.content
                ))
                .with_from(source::VIRTUAL_MEMORY),
            );
        }
        self.unref.clear();
        out
    }

    // ── Search ────────────────────────────────────────────────────────────────

    /// Substring search over page bodies; returns `(id, snippet)` pairs.
    pub fn search_exact(&self, query: &str) -> Vec<(String, String)> {
        let pages = match self.store.lock().expect("store lock").all() {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };
        search_pages(&pages, query)
    }

    /// Lexical-overlap ranking over page summaries.  Pluggable in principle;
    /// the minimal contract is recent-ref-boosted ranking over summaries.
    pub fn search_semantic(&self, query: &str) -> Vec<(String, f32)> {
        let pages = match self.store.lock().expect("store lock").all() {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };
        let mut scored: Vec<(String, f32)> = pages
            .iter()
            .map(|p| {
                let base = token_overlap(query, p.display_summary())
                    .max(token_overlap(query, &p.label));
                let boost = self
                    .ref_requests
                    .get(&p.id)
                    .map(|t| 0.5f32.powi((self.turn.saturating_sub(*t)) as i32))
                    .unwrap_or(0.0);
                (p.id.clone(), base + 0.5 * boost)
            })
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

/// Substring search over a page set; shared by [`VirtualMemory::search_exact`]
/// and the `memory_search` builtin tool.
pub fn search_pages(pages: &[Page], query: &str) -> Vec<(String, String)> {
    if query.is_empty() {
        return Vec::new();
    }
    pages
        .iter()
        .filter_map(|p| {
            p.content.find(query).map(|pos| {
                let start = pos.saturating_sub(40);
                let end = (pos + query.len() + 40).min(p.content.len());
                // Snap to char boundaries for the snippet window.
                let start = (0..=start)
                    .rev()
                    .find(|i| p.content.is_char_boundary(*i))
                    .unwrap_or(0);
                let end = (end..=p.content.len())
                    .find(|i| p.content.is_char_boundary(*i))
                    .unwrap_or(p.content.len());
                (p.id.clone(), p.content[start..end].to_string())
            })
        })
        .collect()
}

/// Fraction of `query` terms present in `text`.
fn token_overlap(query: &str, text: &str) -> f32 {
    let terms: HashSet<String> = tokenize(query).collect();
    if terms.is_empty() {
        return 0.0;
    }
    let body: HashSet<String> = tokenize(text).collect();
    let shared = terms.iter().filter(|t| body.contains(*t)).count();
    shared as f32 / terms.len() as f32
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
