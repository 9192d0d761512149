// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Session-scoped runtime knobs.
//!
//! Everything here is mutable through directives and clamped to its valid
//! range; out-of-range requests are clamped with a warning rather than
//! rejected.  Nothing persists across restarts except learned facts (on
//! disk) and the base model pin (CLI).

use serde_json::json;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RuntimeState {
    /// Model in effect this turn.
    pub model: String,
    /// Provider owning `model`.
    pub provider: String,
    /// True when the operator pinned the model explicitly; tier selection is
    /// skipped for pinned sessions.
    pub model_pinned: bool,
    /// Model switch requested by a directive; takes effect next turn.
    next_model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub thinking_budget: f32,
    /// Active memory implementation label (`ctrl:memory=...`).
    pub memory_kind: String,
}

impl RuntimeState {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, pinned: bool) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            model_pinned: pinned,
            next_model: None,
            temperature: None,
            top_p: None,
            top_k: None,
            thinking_budget: 0.0,
            memory_kind: "paged".into(),
        }
    }

    pub fn set_temperature(&mut self, value: f32) {
        if !(0.0..=2.0).contains(&value) {
            warn!(value, "temperature out of range; clamping to [0, 2]");
        }
        self.temperature = Some(value.clamp(0.0, 2.0));
    }

    pub fn set_top_p(&mut self, value: f32) {
        if !(0.0..=1.0).contains(&value) {
            warn!(value, "top_p out of range; clamping to [0, 1]");
        }
        self.top_p = Some(value.clamp(0.0, 1.0));
    }

    pub fn set_top_k(&mut self, value: u32) {
        if value == 0 {
            warn!("top_k must be positive; using 1");
        }
        self.top_k = Some(value.max(1));
    }

    pub fn set_thinking(&mut self, value: f32) {
        if !(0.0..=1.0).contains(&value) {
            warn!(value, "thinking budget out of range; clamping to [0, 1]");
        }
        self.thinking_budget = value.clamp(0.0, 1.0);
    }

    pub fn thinking_up(&mut self) {
        self.thinking_budget = (self.thinking_budget + 0.3).min(1.0);
    }

    pub fn thinking_down(&mut self) {
        self.thinking_budget = (self.thinking_budget - 0.3).max(0.0);
    }

    /// Request a model switch; applied at the start of the following turn.
    pub fn request_model(&mut self, alias: impl Into<String>) {
        self.next_model = Some(alias.into());
    }

    /// Take the pending model switch, if any.  The switch pins the model for
    /// the rest of the session.
    pub fn take_model_change(&mut self) -> Option<String> {
        self.next_model.take()
    }

    pub fn set_memory_kind(&mut self, kind: impl Into<String>) {
        self.memory_kind = kind.into();
    }

    /// Diagnostic snapshot.
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "model": self.model,
            "provider": self.provider,
            "model_pinned": self.model_pinned,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "top_k": self.top_k,
            "thinking_budget": self.thinking_budget,
            "memory_kind": self.memory_kind,
        })
    }

    pub fn sampling(&self) -> gro_model::Sampling {
        gro_model::Sampling {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RuntimeState {
        RuntimeState::new("anthropic", "claude-sonnet-4-5", false)
    }

    #[test]
    fn temperature_clamped_to_range() {
        let mut s = state();
        s.set_temperature(3.5);
        assert_eq!(s.temperature, Some(2.0));
        s.set_temperature(-1.0);
        assert_eq!(s.temperature, Some(0.0));
        s.set_temperature(0.7);
        assert_eq!(s.temperature, Some(0.7));
    }

    #[test]
    fn top_k_floor_is_one() {
        let mut s = state();
        s.set_top_k(0);
        assert_eq!(s.top_k, Some(1));
    }

    #[test]
    fn thinking_steps_clamp_at_both_ends() {
        let mut s = state();
        s.thinking_up();
        s.thinking_up();
        s.thinking_up();
        s.thinking_up();
        assert_eq!(s.thinking_budget, 1.0);
        for _ in 0..5 {
            s.thinking_down();
        }
        assert_eq!(s.thinking_budget, 0.0);
    }

    #[test]
    fn model_change_is_deferred_until_taken() {
        let mut s = state();
        s.request_model("claude-opus-4-5");
        assert_eq!(s.model, "claude-sonnet-4-5", "not applied immediately");
        assert_eq!(s.take_model_change().as_deref(), Some("claude-opus-4-5"));
        assert!(s.take_model_change().is_none(), "consumed once");
    }

    #[test]
    fn snapshot_reflects_current_values() {
        let mut s = state();
        s.set_thinking(0.6);
        let snap = s.snapshot();
        assert_eq!(snap["thinking_budget"], 0.6);
        assert_eq!(snap["model"], "claude-sonnet-4-5");
    }
}
