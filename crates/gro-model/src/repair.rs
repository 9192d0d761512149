// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! History repair.
//!
//! Compaction and session resumption can leave the canonical history in
//! states every target API rejects: an assistant tool-use with no downstream
//! result, a tool result whose call no longer exists, or a call/result pair
//! separated by unrelated turns.  The drivers run these repair passes, in
//! order, before wire translation:
//!
//! 1. unanswered tool-use → stripped ([`RepairStyle::Strip`]) or answered
//!    with a placeholder result ([`RepairStyle::Placeholder`]);
//! 2. orphan tool-result → dropped;
//! 3. non-adjacent call/result pair → call stripped, distant result dropped.
//!
//! Afterwards the list is guaranteed non-empty and to end on a
//! user-equivalent turn.  Auto-injected continuation turns are bounded: once
//! three of them accumulate in recent history, the trailing assistant turn
//! is stripped instead, which breaks otherwise-infinite continuation loops.

use std::collections::HashSet;

use crate::types::{ChatMessage, Role};

/// Placeholder body for a synthetic tool result (dialect β orphan repair).
pub const TRUNCATED_RESULT: &str = "[context compressed — tool result truncated]";

/// Text of the auto-injected continuation turn.
pub const CONTINUE_TEXT: &str = "(continue)";

/// How many auto-injected continuations may appear in recent history before
/// the repair strips the trailing assistant turn instead of adding another.
const MAX_CONTINUATIONS: usize = 3;

/// Window (in messages) considered "recent history" for the loop breaker.
const CONTINUATION_WINDOW: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStyle {
    /// Remove the offending tool-use (dialects α and γ).
    Strip,
    /// Answer the orphan tool-use with [`TRUNCATED_RESULT`] (dialect β).
    Placeholder,
}

/// Run the three repair passes plus the tail guarantees.
pub fn repair_history(messages: Vec<ChatMessage>, style: RepairStyle) -> Vec<ChatMessage> {
    let repaired = pass_adjacency(pass_orphan_results(pass_unanswered_calls(messages, style)));
    ensure_tail(repaired)
}

/// Pass 1: every assistant tool-call must have a matching tool result
/// somewhere downstream.
fn pass_unanswered_calls(messages: Vec<ChatMessage>, style: RepairStyle) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for (i, mut msg) in messages.clone().into_iter().enumerate() {
        if msg.role != Role::Assistant || msg.tool_calls.is_empty() {
            out.push(msg);
            continue;
        }
        let answered: HashSet<&str> = messages[i + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        let unanswered: Vec<_> = msg
            .tool_calls
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .cloned()
            .collect();
        if unanswered.is_empty() {
            out.push(msg);
            continue;
        }
        match style {
            RepairStyle::Strip => {
                msg.tool_calls.retain(|c| answered.contains(c.id.as_str()));
                // Drop the now-empty carrier entirely.
                if !msg.tool_calls.is_empty() || !msg.content.trim().is_empty() {
                    out.push(msg);
                }
            }
            RepairStyle::Placeholder => {
                out.push(msg);
                for call in unanswered {
                    out.push(ChatMessage::tool_result(
                        call.id.clone(),
                        call.name.clone(),
                        TRUNCATED_RESULT,
                    ));
                }
            }
        }
    }
    out
}

/// Pass 2: drop tool results whose tool-use no longer exists upstream.
fn pass_orphan_results(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut known: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            Role::Assistant => {
                for c in &msg.tool_calls {
                    known.insert(c.id.clone());
                }
                out.push(msg);
            }
            Role::Tool => {
                let ok = msg
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| known.contains(id));
                if ok {
                    out.push(msg);
                }
            }
            _ => out.push(msg),
        }
    }
    out
}

/// Pass 3: a tool-use whose result is not in the contiguous run of tool
/// messages immediately following its assistant turn is stripped; the
/// distant result is dropped with it.
fn pass_adjacency(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut dropped_results: HashSet<String> = HashSet::new();
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        if msg.role != Role::Assistant || msg.tool_calls.is_empty() {
            i += 1;
            let keep = match msg.role {
                Role::Tool => !msg
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| dropped_results.contains(id)),
                _ => true,
            };
            if keep {
                out.push(msg.clone());
            }
            continue;
        }
        // Collect the contiguous tool-message run right after this turn.
        // System messages never enter the wire conversation, so they do not
        // break adjacency.
        let mut adjacent: HashSet<&str> = HashSet::new();
        let mut j = i + 1;
        while j < messages.len()
            && matches!(messages[j].role, Role::Tool | Role::System)
        {
            if let Some(id) = messages[j].tool_call_id.as_deref() {
                adjacent.insert(id);
            }
            j += 1;
        }
        let mut kept = msg.clone();
        for call in &msg.tool_calls {
            if !adjacent.contains(call.id.as_str()) {
                dropped_results.insert(call.id.clone());
            }
        }
        kept.tool_calls
            .retain(|c| adjacent.contains(c.id.as_str()));
        if !kept.tool_calls.is_empty() || !kept.content.trim().is_empty() {
            out.push(kept);
        }
        i += 1;
    }
    out
}

/// Non-empty and user-equivalent-tail guarantees.
fn ensure_tail(mut messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let has_conversation = messages.iter().any(|m| m.role != Role::System);
    if !has_conversation {
        messages.push(ChatMessage::user(CONTINUE_TEXT));
        return messages;
    }
    let ends_on_assistant = messages
        .last()
        .map(|m| m.role == Role::Assistant && m.tool_calls.is_empty())
        .unwrap_or(false);
    if !ends_on_assistant {
        return messages;
    }
    let recent_continuations = messages
        .iter()
        .rev()
        .take(CONTINUATION_WINDOW)
        .filter(|m| m.role == Role::User && m.content == CONTINUE_TEXT)
        .count();
    if recent_continuations >= MAX_CONTINUATIONS {
        messages.pop();
    } else {
        messages.push(ChatMessage::user(CONTINUE_TEXT));
    }
    messages
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
