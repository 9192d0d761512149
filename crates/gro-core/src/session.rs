// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Session persistence.
//!
//! `{messages.json, meta.json}` under `<state-dir>/context/<session-id>/`,
//! written atomically after every turn.  Loading runs a repair pass so a
//! session interrupted mid-tool-call never presents an impossible history to
//! the drivers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gro_model::{ChatMessage, Role};

pub const INTERRUPTED_RESULT: &str = "[Session interrupted — tool call was not completed]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionMeta {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            // Short opaque id: the first uuid group is plenty.
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            provider: provider.into(),
            model: model.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Root of the persisted state tree (`<work-dir>/.gro`).
pub fn state_root(work_dir: &Path) -> PathBuf {
    work_dir.join(".gro")
}

pub fn sessions_dir(state_root: &Path) -> PathBuf {
    state_root.join("context")
}

pub fn pages_dir(state_root: &Path) -> PathBuf {
    state_root.join("pages")
}

pub fn learn_file(state_root: &Path) -> PathBuf {
    state_root.join("_learn.md")
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Save messages and meta, creating the session directory as needed.
pub fn save_session(
    sessions_dir: &Path,
    meta: &SessionMeta,
    messages: &[ChatMessage],
) -> anyhow::Result<()> {
    let dir = sessions_dir.join(&meta.id);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    write_atomic(
        &dir.join("messages.json"),
        &serde_json::to_string_pretty(messages)?,
    )?;
    write_atomic(&dir.join("meta.json"), &serde_json::to_string_pretty(meta)?)?;
    Ok(())
}

/// Load a session and repair its tool pairs.
pub fn load_session(
    sessions_dir: &Path,
    id: &str,
) -> anyhow::Result<(SessionMeta, Vec<ChatMessage>)> {
    let dir = sessions_dir.join(id);
    let meta_text = std::fs::read_to_string(dir.join("meta.json"))
        .with_context(|| format!("reading session {id} meta"))?;
    let meta: SessionMeta =
        serde_json::from_str(&meta_text).with_context(|| format!("parsing session {id} meta"))?;
    let messages_text = std::fs::read_to_string(dir.join("messages.json"))
        .with_context(|| format!("reading session {id} messages"))?;
    let messages: Vec<ChatMessage> = serde_json::from_str(&messages_text)
        .with_context(|| format!("parsing session {id} messages"))?;
    Ok((meta, sanitize_tool_pairs(messages)))
}

/// Repair tool pairing after an interrupted save:
///
/// - tool messages whose call no longer exists are dropped;
/// - assistant calls with no result get a synthetic "[Session interrupted…]"
///   result, so the driver-level repair never starts from an impossible
///   state.
pub fn sanitize_tool_pairs(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let known: HashSet<String> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
        .collect();
    let answered: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();

    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            Role::Tool => {
                let ok = msg
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| known.contains(id));
                if ok {
                    out.push(msg);
                }
            }
            Role::Assistant if !msg.tool_calls.is_empty() => {
                let unanswered: Vec<_> = msg
                    .tool_calls
                    .iter()
                    .filter(|c| !answered.contains(&c.id))
                    .cloned()
                    .collect();
                out.push(msg);
                for call in unanswered {
                    out.push(ChatMessage::tool_result(
                        call.id,
                        call.name,
                        INTERRUPTED_RESULT,
                    ));
                }
            }
            _ => out.push(msg),
        }
    }
    out
}

/// All sessions under `sessions_dir`, sorted by meta modification time,
/// newest first.
pub fn list_sessions(sessions_dir: &Path) -> Vec<SessionMeta> {
    let Ok(entries) = std::fs::read_dir(sessions_dir) else {
        return Vec::new();
    };
    let mut found: Vec<(std::time::SystemTime, SessionMeta)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            let meta_path = entry.path().join("meta.json");
            let mtime = meta_path.metadata().ok()?.modified().ok()?;
            let meta: SessionMeta =
                serde_json::from_str(&std::fs::read_to_string(&meta_path).ok()?).ok()?;
            Some((mtime, meta))
        })
        .collect();
    found.sort_by_key(|(mtime, _)| std::cmp::Reverse(*mtime));
    found.into_iter().map(|(_, meta)| meta).collect()
}

/// The most recently updated session, if any (`--continue`).
pub fn latest_session(sessions_dir: &Path) -> Option<SessionMeta> {
    list_sessions(sessions_dir).into_iter().next()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
