// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Thinking/reasoning extensions.
//!
//! The scalar thinking budget in [0, 1] maps onto one of three per-provider
//! strategies: an adaptive effort label, a manual reasoning-token budget, or
//! nothing.  Whether a model participates at all is decided by a per-model
//! pattern table.
//!
//! A model that rejects a thinking request is remembered in a process-wide
//! set so later calls skip the field without a round-trip rejection.  The set
//! is process-wide by design (see DESIGN.md) and resettable for tests.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

/// Effort label for the adaptive strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effort {
    Low,
    Medium,
    High,
    Max,
}

impl Effort {
    /// Wire value.  `Max` is sent as "high" — no current adaptive API accepts
    /// a fourth tier, but the label is kept distinct for tier selection.
    pub fn wire_value(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High | Self::Max => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingStrategy {
    /// Send an effort label (dialect β reasoning models).
    Adaptive(Effort),
    /// Send an explicit reasoning-token budget (dialects α and γ).
    Manual { budget_tokens: u32 },
    /// The model does not reason, or the budget is zero.
    Disabled,
}

pub fn effort_for(budget: f32) -> Effort {
    match budget {
        b if b <= 0.25 => Effort::Low,
        b if b <= 0.5 => Effort::Medium,
        b if b <= 0.85 => Effort::High,
        _ => Effort::Max,
    }
}

/// Manual reasoning-token allocation: `max_tokens × budget × 0.7`.
pub fn manual_budget(max_tokens: u32, budget: f32) -> u32 {
    (max_tokens as f32 * budget.clamp(0.0, 1.0) * 0.7) as u32
}

/// Per-model capability table.  Pattern matching on the model id keeps this a
/// pure function with no network round-trip.
pub fn supports_thinking(provider: &str, model: &str) -> bool {
    match provider {
        "anthropic" => {
            model.contains("claude-3-7")
                || model.contains("claude-opus-4")
                || model.contains("claude-sonnet-4")
                || model.contains("claude-haiku-4")
        }
        "openai" => {
            model.starts_with("o1")
                || model.starts_with("o3")
                || model.starts_with("o4")
                || model.starts_with("gpt-5")
        }
        "google" => model.contains("gemini-2.5") || model.contains("gemini-3"),
        _ => false,
    }
}

/// Decide the strategy for one call.
pub fn strategy_for(
    provider: &str,
    model: &str,
    budget: f32,
    max_tokens: u32,
) -> ThinkingStrategy {
    if budget <= 0.0 || !supports_thinking(provider, model) || is_rejected(model) {
        return ThinkingStrategy::Disabled;
    }
    match provider {
        "openai" => ThinkingStrategy::Adaptive(effort_for(budget)),
        "anthropic" | "google" => ThinkingStrategy::Manual {
            // Anthropic requires at least 1024 budget tokens when enabled.
            budget_tokens: manual_budget(max_tokens, budget).max(1024),
        },
        _ => ThinkingStrategy::Disabled,
    }
}

// ─── Rejection cache ─────────────────────────────────────────────────────────

fn rejected_models() -> &'static Mutex<HashSet<String>> {
    static SET: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    SET.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Record that `model` rejected a thinking-enabled request.
pub fn mark_rejected(model: &str) {
    rejected_models()
        .lock()
        .expect("rejection set lock")
        .insert(model.to_string());
}

pub fn is_rejected(model: &str) -> bool {
    rejected_models()
        .lock()
        .expect("rejection set lock")
        .contains(model)
}

/// Clear the process-wide set.  Test hook.
pub fn reset_rejections() {
    rejected_models().lock().expect("rejection set lock").clear();
}

/// Does this 4xx response body indicate a rejected thinking request?
pub fn is_thinking_rejection(status: u16, body: &str) -> bool {
    if !(400..500).contains(&status) {
        return false;
    }
    let lower = body.to_ascii_lowercase();
    lower.contains("thinking") || lower.contains("not supported")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effort_tiers_cover_the_budget_range() {
        assert_eq!(effort_for(0.1), Effort::Low);
        assert_eq!(effort_for(0.4), Effort::Medium);
        assert_eq!(effort_for(0.7), Effort::High);
        assert_eq!(effort_for(1.0), Effort::Max);
    }

    #[test]
    fn max_effort_wire_value_is_high() {
        assert_eq!(Effort::Max.wire_value(), "high");
        assert_eq!(Effort::Low.wire_value(), "low");
    }

    #[test]
    fn manual_budget_is_seventy_percent_of_share() {
        assert_eq!(manual_budget(10_000, 1.0), 7_000);
        assert_eq!(manual_budget(10_000, 0.5), 3_500);
        assert_eq!(manual_budget(10_000, 0.0), 0);
    }

    #[test]
    fn capability_table_matches_known_models() {
        assert!(supports_thinking("anthropic", "claude-opus-4-5"));
        assert!(supports_thinking("anthropic", "claude-3-7-sonnet-20250219"));
        assert!(!supports_thinking("anthropic", "claude-3-5-haiku-latest"));
        assert!(supports_thinking("openai", "o3-mini"));
        assert!(supports_thinking("openai", "gpt-5"));
        assert!(!supports_thinking("openai", "gpt-4o"));
        assert!(supports_thinking("google", "gemini-2.5-pro"));
        assert!(!supports_thinking("google", "gemini-2.0-flash"));
    }

    #[test]
    fn zero_budget_disables() {
        assert_eq!(
            strategy_for("anthropic", "claude-opus-4-5", 0.0, 8192),
            ThinkingStrategy::Disabled
        );
    }

    #[test]
    fn anthropic_strategy_is_manual_with_floor() {
        match strategy_for("anthropic", "claude-opus-4-5", 0.1, 4096) {
            ThinkingStrategy::Manual { budget_tokens } => {
                assert!(budget_tokens >= 1024, "budget must respect the API floor");
            }
            other => panic!("expected Manual, got {other:?}"),
        }
    }

    #[test]
    fn openai_strategy_is_adaptive() {
        assert_eq!(
            strategy_for("openai", "o3-mini", 0.9, 4096),
            ThinkingStrategy::Adaptive(Effort::Max)
        );
    }

    #[test]
    fn rejection_cache_round_trip() {
        // Unique model name so parallel tests sharing the process-wide set
        // cannot interfere.
        let model = "claude-opus-4-reject-probe";
        assert!(!is_rejected(model));
        mark_rejected(model);
        assert!(is_rejected(model));
        assert_eq!(
            strategy_for("anthropic", model, 0.5, 4096),
            ThinkingStrategy::Disabled,
            "rejected models must skip thinking regardless of capability"
        );
    }

    #[test]
    fn rejection_detection_requires_4xx() {
        assert!(is_thinking_rejection(400, "thinking is not supported on this model"));
        assert!(is_thinking_rejection(422, "feature not supported"));
        assert!(!is_thinking_rejection(500, "thinking exploded"));
        assert!(!is_thinking_rejection(400, "malformed JSON body"));
    }
}
