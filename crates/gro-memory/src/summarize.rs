// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Summary generation for compacted pages.
//!
//! Three modes: a synchronous model call (bounded by a timeout, falling back
//! to fragmentation), a batch placeholder rewritten later by the worker, and
//! zero-cost fragmentation sampling.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use gro_model::ChatMessage;

/// Prompt sent for synchronous and batch summarization.
pub const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation slice \
     in a concise, information-dense way. Preserve decisions, names, identifiers, and any \
     details future turns may need. The summary stands in for the original messages.";

/// Upper bound on a synchronous summary call; past this the add falls back
/// to fragmentation so memory pressure is never blocked on a slow model.
pub const SYNC_SUMMARY_TIMEOUT: Duration = Duration::from_secs(30);

/// The single-method interface the memory system holds on the driver.
///
/// Keeping this edge to one method breaks the memory ↔ driver cycle: memory
/// never sees the scheduler or the full driver surface.
#[async_trait]
pub trait SummaryChat: Send + Sync {
    async fn chat(&self, prompt: String) -> anyhow::Result<String>;
}

/// Serialise a message slice into the plain-text dump used as a page body.
pub fn serialize_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                gro_model::Role::User => "User",
                gro_model::Role::Assistant => "Assistant",
                gro_model::Role::System => "System",
                gro_model::Role::Tool => "Tool",
            };
            if m.tool_calls.is_empty() {
                format!("{role}: {}", m.content)
            } else {
                let calls: Vec<String> = m
                    .tool_calls
                    .iter()
                    .map(|c| format!("[tool_call: {}({})]", c.name, c.arguments))
                    .collect();
                format!("{role}: {} {}", m.content, calls.join(" "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn placeholder_summary(message_count: usize) -> String {
    format!("[Pending summary for {message_count} messages]")
}

pub const SUMMARY_UNAVAILABLE: &str = "[Summary unavailable]";

/// Synchronous summarization with a hard timeout.
pub async fn summarize_sync(
    model: &dyn SummaryChat,
    body: &str,
    messages: &[ChatMessage],
    fragments: usize,
) -> String {
    let prompt = format!("{SUMMARIZE_PROMPT}\n\n---\n\n{body}");
    match tokio::time::timeout(SYNC_SUMMARY_TIMEOUT, model.chat(prompt)).await {
        Ok(Ok(summary)) if !summary.trim().is_empty() => summary,
        Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
            warn!("synchronous summary failed; falling back to fragmentation");
            fragment_summary(messages, fragments)
        }
    }
}

/// Zero-cost summary: sample `k` random windows of consecutive messages,
/// record their positions, and concatenate them.
pub fn fragment_summary(messages: &[ChatMessage], k: usize) -> String {
    let n = messages.len();
    if n == 0 {
        return "[Fragmented: 0 fragments, 0 sampled from 0]".to_string();
    }
    let window = 2usize.min(n);
    let k = k.max(1).min(n);
    let mut rng = rand::thread_rng();
    let mut starts: Vec<usize> = (0..k)
        .map(|_| rng.gen_range(0..=(n - window)))
        .collect();
    starts.sort_unstable();
    starts.dedup();

    let mut sampled = 0usize;
    let mut parts: Vec<String> = Vec::new();
    for start in &starts {
        let slice = &messages[*start..(*start + window).min(n)];
        sampled += slice.len();
        parts.push(format!(
            "[{}..{}] {}",
            start,
            (start + window).min(n) - 1,
            serialize_messages(slice)
        ));
    }
    format!(
        "[Fragmented: {} fragments, {} sampled from {}]\n{}",
        starts.len(),
        sampled,
        n,
        parts.join("\n")
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSummary(&'static str);

    #[async_trait]
    impl SummaryChat for FixedSummary {
        async fn chat(&self, _prompt: String) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingSummary;

    #[async_trait]
    impl SummaryChat for FailingSummary {
        async fn chat(&self, _prompt: String) -> anyhow::Result<String> {
            anyhow::bail!("model unavailable")
        }
    }

    fn history(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| ChatMessage::user(format!("message number {i}")))
            .collect()
    }

    #[test]
    fn serialize_prefixes_roles() {
        let text = serialize_messages(&[
            ChatMessage::user("ask"),
            ChatMessage::assistant("answer"),
        ]);
        assert!(text.contains("User: ask"));
        assert!(text.contains("Assistant: answer"));
    }

    #[test]
    fn serialize_includes_tool_calls() {
        let msg = ChatMessage::assistant_with_calls(
            "",
            vec![gro_model::ToolCall {
                id: "t1".into(),
                name: "shell".into(),
                arguments: r#"{"command":"ls"}"#.into(),
            }],
        );
        let text = serialize_messages(&[msg]);
        assert!(text.contains("shell"));
        assert!(text.contains("ls"));
    }

    #[test]
    fn placeholder_names_message_count() {
        assert_eq!(placeholder_summary(7), "[Pending summary for 7 messages]");
    }

    #[tokio::test]
    async fn sync_summary_uses_model_output() {
        let msgs = history(4);
        let body = serialize_messages(&msgs);
        let s = summarize_sync(&FixedSummary("dense summary"), &body, &msgs, 3).await;
        assert_eq!(s, "dense summary");
    }

    #[tokio::test]
    async fn sync_summary_failure_falls_back_to_fragments() {
        let msgs = history(6);
        let body = serialize_messages(&msgs);
        let s = summarize_sync(&FailingSummary, &body, &msgs, 3).await;
        assert!(s.starts_with("[Fragmented:"), "got: {s}");
    }

    #[test]
    fn fragment_summary_reports_counts() {
        let msgs = history(10);
        let s = fragment_summary(&msgs, 3);
        assert!(s.starts_with("[Fragmented: "));
        assert!(s.contains("sampled from 10"));
        // Positions of sampled windows are recorded.
        assert!(s.contains(".."));
    }

    #[test]
    fn fragment_summary_of_empty_slice() {
        let s = fragment_summary(&[], 3);
        assert_eq!(s, "[Fragmented: 0 fragments, 0 sampled from 0]");
    }

    #[test]
    fn fragment_summary_samples_existing_messages() {
        let msgs = history(5);
        let s = fragment_summary(&msgs, 2);
        assert!(
            s.contains("message number"),
            "fragments must quote real content: {s}"
        );
    }
}
