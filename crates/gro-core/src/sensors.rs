// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Repeat detection and resource familiarity.
//!
//! Neither sensor ever blocks execution; both only feed the sensory buffer
//! so the model can see its own behaviour.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

// ─── Deja-vu tracker ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DejaVuEntry {
    pub count: u32,
    pub last_turn: u64,
    pub result_preview: String,
}

/// Tracks repeated identical tool calls keyed by `(tool, canonical args)`.
pub struct DejaVu {
    window: usize,
    threshold: u32,
    order: VecDeque<String>,
    entries: HashMap<String, (String, DejaVuEntry)>, // key → (display name, entry)
}

impl Default for DejaVu {
    fn default() -> Self {
        Self::new(100, 2)
    }
}

impl DejaVu {
    pub fn new(window: usize, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Canonical hash of a JSON argument string: parsed and re-serialised so
    /// key order and whitespace do not defeat the match.
    fn key(tool: &str, arguments: &str) -> String {
        let canonical = serde_json::from_str::<serde_json::Value>(arguments)
            .map(|v| v.to_string())
            .unwrap_or_else(|_| arguments.to_string());
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        format!("{tool}:{:016x}", hasher.finish())
    }

    /// Record one call; returns the repeat count for this exact call.
    pub fn record(
        &mut self,
        tool: &str,
        arguments: &str,
        result_preview: &str,
        turn: u64,
    ) -> u32 {
        let key = Self::key(tool, arguments);
        let preview: String = result_preview.chars().take(120).collect();
        if !self.entries.contains_key(&key) {
            self.order.push_back(key.clone());
            self.entries.insert(
                key.clone(),
                (
                    tool.to_string(),
                    DejaVuEntry {
                        count: 0,
                        last_turn: turn,
                        result_preview: String::new(),
                    },
                ),
            );
        }
        let entry = self.entries.get_mut(&key).expect("inserted above");
        entry.1.count += 1;
        entry.1.last_turn = turn;
        entry.1.result_preview = preview;
        let count = entry.1.count;

        while self.order.len() > self.window {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        count
    }

    /// Warnings for the sensory buffer: every tracked call at or above the
    /// repeat threshold, referencing its prior result.
    pub fn warnings(&self) -> Vec<String> {
        let mut out: Vec<(u64, String)> = self
            .entries
            .values()
            .filter(|(_, e)| e.count >= self.threshold)
            .map(|(tool, e)| {
                (
                    e.last_turn,
                    format!(
                        "deja-vu: {tool} called {}x with identical arguments; \
                         previous result: {}",
                        e.count, e.result_preview
                    ),
                )
            })
            .collect();
        out.sort_by_key(|(turn, _)| std::cmp::Reverse(*turn));
        out.into_iter().map(|(_, w)| w).collect()
    }
}

// ─── Familiarity tracker ─────────────────────────────────────────────────────

/// Per-resource recency score with exponential boost and decay.
pub struct Familiarity {
    boost: f32,
    decay: f32,
    prune_below: f32,
    max_entries: usize,
    scores: HashMap<String, f32>,
}

impl Default for Familiarity {
    fn default() -> Self {
        Self::new(0.4, 0.9, 0.05, 200)
    }
}

impl Familiarity {
    pub fn new(boost: f32, decay: f32, prune_below: f32, max_entries: usize) -> Self {
        Self {
            boost,
            decay,
            prune_below,
            max_entries,
            scores: HashMap::new(),
        }
    }

    /// `score += (1 − score) × boost`
    pub fn access(&mut self, resource: &str) {
        let score = self.scores.entry(resource.to_string()).or_insert(0.0);
        *score += (1.0 - *score) * self.boost;
    }

    /// Apply the per-turn decay and prune cold or overflow entries.
    pub fn decay_turn(&mut self) {
        for score in self.scores.values_mut() {
            *score *= self.decay;
        }
        self.scores.retain(|_, s| *s >= self.prune_below);
        if self.scores.len() > self.max_entries {
            let mut by_score: Vec<(String, f32)> = self
                .scores
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            by_score.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let excess = self.scores.len() - self.max_entries;
            for (k, _) in by_score.into_iter().take(excess) {
                self.scores.remove(&k);
            }
        }
    }

    /// The `n` most familiar resources, strongest first.
    pub fn top(&self, n: usize) -> Vec<(String, f32)> {
        let mut all: Vec<(String, f32)> = self
            .scores
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        all.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        all.truncate(n);
        all
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Deja-vu ───────────────────────────────────────────────────────────────

    #[test]
    fn first_call_counts_one_and_warns_nothing() {
        let mut dv = DejaVu::default();
        assert_eq!(dv.record("shell", r#"{"command":"ls"}"#, "file.txt", 1), 1);
        assert!(dv.warnings().is_empty());
    }

    #[test]
    fn repeat_reaches_threshold_and_warns() {
        let mut dv = DejaVu::default();
        dv.record("shell", r#"{"command":"ls"}"#, "file.txt", 1);
        let count = dv.record("shell", r#"{"command":"ls"}"#, "file.txt", 2);
        assert_eq!(count, 2);
        let warnings = dv.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("shell called 2x"));
        assert!(warnings[0].contains("file.txt"), "must reference prior result");
    }

    #[test]
    fn argument_key_order_does_not_defeat_the_match() {
        let mut dv = DejaVu::default();
        dv.record("grep", r#"{"pattern":"x","path":"src"}"#, "", 1);
        let count = dv.record("grep", r#"{"path":"src","pattern":"x"}"#, "", 2);
        assert_eq!(count, 2, "canonicalised JSON must match regardless of key order");
    }

    #[test]
    fn different_arguments_are_distinct() {
        let mut dv = DejaVu::default();
        dv.record("shell", r#"{"command":"ls"}"#, "", 1);
        assert_eq!(dv.record("shell", r#"{"command":"pwd"}"#, "", 2), 1);
    }

    #[test]
    fn fifo_eviction_past_window() {
        let mut dv = DejaVu::new(3, 2);
        for i in 0..5 {
            dv.record("t", &format!(r#"{{"i":{i}}}"#), "", i);
        }
        // Entry 0 and 1 were evicted; re-recording starts at count 1.
        assert_eq!(dv.record("t", r#"{"i":0}"#, "", 9), 1);
    }

    #[test]
    fn three_identical_calls_warn_with_count() {
        let mut dv = DejaVu::default();
        for turn in 1..=3 {
            dv.record("inbox_listen", "{}", "(no messages)", turn);
        }
        let w = dv.warnings();
        assert!(w[0].contains("3x"));
    }

    // ── Familiarity ───────────────────────────────────────────────────────────

    #[test]
    fn access_boost_follows_formula() {
        let mut f = Familiarity::default();
        f.access("file:src/main.rs");
        assert!((f.top(1)[0].1 - 0.4).abs() < 1e-6);
        f.access("file:src/main.rs");
        // 0.4 + 0.6×0.4 = 0.64
        assert!((f.top(1)[0].1 - 0.64).abs() < 1e-6);
    }

    #[test]
    fn decay_shrinks_scores() {
        let mut f = Familiarity::default();
        f.access("r");
        f.decay_turn();
        assert!((f.top(1)[0].1 - 0.36).abs() < 1e-6);
    }

    #[test]
    fn cold_entries_are_pruned() {
        let mut f = Familiarity::new(0.4, 0.1, 0.05, 200);
        f.access("fleeting");
        f.decay_turn(); // 0.04 < 0.05
        assert!(f.is_empty());
    }

    #[test]
    fn overflow_prunes_lowest_first() {
        let mut f = Familiarity::new(0.4, 0.9, 0.0001, 2);
        f.access("a");
        f.access("b");
        f.access("b");
        f.access("c");
        f.access("c");
        f.access("c");
        f.decay_turn();
        assert_eq!(f.len(), 2);
        let names: Vec<String> = f.top(2).into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"b".to_string()));
        assert!(names.contains(&"c".to_string()));
    }

    #[test]
    fn top_returns_strongest_first() {
        let mut f = Familiarity::default();
        f.access("weak");
        f.access("strong");
        f.access("strong");
        let top = f.top(2);
        assert_eq!(top[0].0, "strong");
    }
}
