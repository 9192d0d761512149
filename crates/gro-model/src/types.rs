// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

// ─── Source tags ─────────────────────────────────────────────────────────────

/// Well-known values for [`ChatMessage::from`].  The virtual memory and the
/// drivers use them to decide compaction eligibility and cache stability.
pub mod source {
    /// The static system prompt.  Never compacted.
    pub const SYSTEM: &str = "System";
    /// Page bodies injected by the auto-fill step.
    pub const VIRTUAL_MEMORY: &str = "VirtualMemory";
    /// Per-turn sensory sections (context map, familiarity, time, feed).
    pub const SENSORY: &str = "SensoryMemory";
}

// ─── Message types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single tool invocation requested by the model.
///
/// `arguments` is the raw JSON string exactly as streamed; fragments are
/// accumulated during streaming and only parsed at finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier assigned by the provider (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// A single message in the canonical conversation history.
///
/// Invariant: every `Role::Tool` message references a `tool_call_id` that
/// appears in the `tool_calls` list of some earlier assistant message.  The
/// drivers' history repair enforces this before anything hits the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Sub-source label, e.g. "System", "VirtualMemory", "SensoryMemory".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Set when `role == Tool`: the id of the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set when `role == Tool`: the name of the tool that produced this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Reasoning trace captured alongside the visible text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Importance weight in [0, 1].  High-importance messages survive
    /// compaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
    /// Tool invocations emitted with this assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            from: None,
            tool_call_id: None,
            tool_name: None,
            reasoning: None,
            importance: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// An assistant turn carrying tool invocations.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut m = Self::text(Role::Assistant, content);
        m.tool_calls = calls;
        m
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut m = Self::text(Role::Tool, content);
        m.tool_call_id = Some(call_id.into());
        m.tool_name = Some(tool_name.into());
        m
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance.clamp(0.0, 1.0));
        self
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.as_deref()
    }

    /// Approximate token count used for context budgeting.
    ///
    /// Uses a 4-chars-per-token heuristic over the visible content plus any
    /// tool-call names and argument strings.  Minimum 1.
    pub fn approx_tokens(&self) -> usize {
        let chars = self.content.len()
            + self
                .tool_calls
                .iter()
                .map(|c| c.name.len() + c.arguments.len())
                .sum::<usize>();
        (chars / 4).max(1)
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

// ─── Requests and responses ──────────────────────────────────────────────────

/// Sampling overrides.  `None` means "use the provider default".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sampling {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
}

/// Request sent to a chat driver.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    /// Model override for this call; `None` uses the driver's configured model.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub sampling: Sampling,
    /// Thinking budget in [0, 1].  0 disables reasoning extensions.
    pub thinking_budget: f32,
    /// Attach provider cache hints where the dialect supports them.
    pub enable_caching: bool,
    /// Cancellation signal descending from the scheduler.
    pub cancel: crate::cancel::CancelSignal,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            tools: Vec::new(),
            model: None,
            max_tokens: 4096,
            sampling: Sampling::default(),
            thinking_budget: 0.0,
            enable_caching: true,
            cancel: crate::cancel::CancelSignal::never(),
        }
    }
}

/// A single streamed event from a driver.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text delta streamed from the model.
    TextDelta(String),
    /// A reasoning/thinking delta (extended reasoning APIs).
    ReasoningDelta(String),
    /// A tool-call delta.  `arguments` may be a partial JSON fragment; the
    /// accumulator joins fragments per `index` and parses at finalization.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Final (or incremental) usage statistics.
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
        cache_write_tokens: u32,
    },
    /// The stream finished normally.
    Done,
}

/// Token usage from one completion round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

impl Usage {
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// The structured result of one completion round.
#[derive(Debug, Clone, Default)]
pub struct ChatOutput {
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_constructor_sets_role_and_content() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content, "hello");
        assert!(m.tool_calls.is_empty());
    }

    #[test]
    fn tool_result_links_call_id_and_name() {
        let m = ChatMessage::tool_result("t1", "shell", "ok");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("t1"));
        assert_eq!(m.tool_name.as_deref(), Some("shell"));
    }

    #[test]
    fn importance_is_clamped() {
        let m = ChatMessage::user("x").with_importance(1.5);
        assert_eq!(m.importance, Some(1.0));
        let m = ChatMessage::user("x").with_importance(-0.2);
        assert_eq!(m.importance, Some(0.0));
    }

    #[test]
    fn approx_tokens_divides_chars_by_four() {
        assert_eq!(ChatMessage::user("12345678").approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(ChatMessage::user("").approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_counts_tool_call_args() {
        let m = ChatMessage::assistant_with_calls(
            "",
            vec![ToolCall {
                id: "t1".into(),
                name: "aaaa".into(),          // 4 chars
                arguments: "bbbbbbbb".into(), // 8 chars
            }],
        );
        assert_eq!(m.approx_tokens(), 3);
    }

    #[test]
    fn serde_round_trip_preserves_message() {
        let m = ChatMessage::assistant_with_calls(
            "running",
            vec![ToolCall {
                id: "t1".into(),
                name: "shell".into(),
                arguments: r#"{"command":"ls"}"#.into(),
            }],
        )
        .with_importance(0.8);
        let json = serde_json::to_string(&m).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn optional_fields_omitted_from_json() {
        let json = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert!(!json.contains("tool_call_id"));
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("importance"));
    }

    #[test]
    fn usage_merge_accumulates() {
        let mut a = Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 2,
            cache_write_tokens: 1,
        };
        a.merge(&Usage {
            input_tokens: 1,
            output_tokens: 1,
            cache_read_tokens: 1,
            cache_write_tokens: 1,
        });
        assert_eq!(a.input_tokens, 11);
        assert_eq!(a.output_tokens, 6);
        assert_eq!(a.cache_read_tokens, 3);
        assert_eq!(a.cache_write_tokens, 2);
    }
}
