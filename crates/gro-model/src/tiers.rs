// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Model tier selection.
//!
//! When no model is pinned for the session, the thinking budget selects a
//! tier across the configured provider preference list: a low budget runs on
//! a cheap fast model, a high budget on the strongest one available.

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Low,
    Mid,
    High,
}

impl FromStr for Tier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "mid" => Ok(Self::Mid),
            "high" => Ok(Self::High),
            other => Err(format!("unknown tier {other:?} (expected low|mid|high)")),
        }
    }
}

pub fn tier_for_budget(budget: f32) -> Tier {
    match budget {
        b if b < 0.34 => Tier::Low,
        b if b < 0.67 => Tier::Mid,
        _ => Tier::High,
    }
}

/// Default model per provider and tier.
pub fn default_model(provider: &str, tier: Tier) -> Option<&'static str> {
    let m = match (provider, tier) {
        ("anthropic", Tier::Low) => "claude-3-5-haiku-latest",
        ("anthropic", Tier::Mid) => "claude-sonnet-4-5",
        ("anthropic", Tier::High) => "claude-opus-4-5",
        ("openai", Tier::Low) => "gpt-4.1-mini",
        ("openai", Tier::Mid) => "gpt-4.1",
        ("openai", Tier::High) => "o3",
        ("google", Tier::Low) => "gemini-2.0-flash",
        ("google", Tier::Mid) => "gemini-2.5-flash",
        ("google", Tier::High) => "gemini-2.5-pro",
        _ => return None,
    };
    Some(m)
}

/// Pick `(provider, model)` for the given budget across the preference list.
///
/// The first provider with a model at the requested (possibly ceilinged)
/// tier wins.  Returns `None` when no provider in the list is recognised.
pub fn select_model(
    providers: &[String],
    budget: f32,
    ceiling: Option<Tier>,
) -> Option<(String, String)> {
    let mut tier = tier_for_budget(budget);
    if let Some(cap) = ceiling {
        tier = tier.min(cap);
    }
    for p in providers {
        if let Some(model) = default_model(p, tier) {
            return Some((p.clone(), model.to_string()));
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
