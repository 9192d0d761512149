// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI chat-completions driver (flat-message dialect).
//!
//! Assistant tool invocations travel in a `tool_calls` array on the message;
//! results use the `tool` role with a 1-to-1 id pairing.  Orphan tool-uses
//! are repaired by inserting a placeholder result rather than stripping the
//! call, which keeps partial transcripts usable after compaction.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    fetch::post_chat_with_retry,
    provider::ResponseStream,
    repair::{repair_history, RepairStyle},
    sse::drain_sse_data,
    thinking::{strategy_for, ThinkingStrategy},
    types::{ChatMessage, ChatRequest, Role, StreamEvent},
    RuntimeError,
};

pub struct OpenAiDriver {
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiDriver {
    pub fn new(model: String, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            client: reqwest::Client::new(),
        }
    }

    fn resolve_key(&self) -> Result<String, RuntimeError> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| RuntimeError::config("OPENAI_API_KEY not set"))
    }
}

/// Reasoning-capable models reject sampling overrides entirely.
fn rejects_sampling(model: &str) -> bool {
    model.starts_with("o1") || model.starts_with("o3") || model.starts_with("gpt-5")
}

#[async_trait]
impl crate::ChatDriver for OpenAiDriver {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, req: ChatRequest) -> Result<ResponseStream, RuntimeError> {
        let key = self.resolve_key()?;
        let model = req.model.clone().unwrap_or_else(|| self.model.clone());
        let messages = repair_history(req.messages.clone(), RepairStyle::Placeholder);

        let wire_messages = build_messages(&messages);
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": true,
            "max_completion_tokens": req.max_tokens,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if !rejects_sampling(&model) {
            if let Some(t) = req.sampling.temperature {
                body["temperature"] = json!(t);
            }
            if let Some(p) = req.sampling.top_p {
                body["top_p"] = json!(p);
            }
            // top_k is not part of this dialect; dropped deliberately.
        }

        let strategy = strategy_for("openai", &model, req.thinking_budget, req.max_tokens);
        let thinking_enabled = if let ThinkingStrategy::Adaptive(effort) = strategy {
            body["reasoning_effort"] = json!(effort.wire_value());
            true
        } else {
            false
        };

        debug!(
            model = %model,
            tools = req.tools.len(),
            thinking = thinking_enabled,
            "sending openai request"
        );

        let headers = vec![("Authorization".to_string(), format!("Bearer {key}"))];
        let strip: Option<fn(&mut Value)> = if thinking_enabled {
            Some(|b: &mut Value| {
                if let Some(o) = b.as_object_mut() {
                    o.remove("reasoning_effort");
                }
            })
        } else {
            None
        };
        let resp = post_chat_with_retry(
            &self.client,
            &format!("{}/chat/completions", self.base_url.trim_end_matches('/')),
            &headers,
            &mut body,
            "openai",
            &model,
            strip,
            &req.cancel,
        )
        .await?;

        let event_stream = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<StreamEvent, RuntimeError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        drain_sse_data(buf)
                            .into_iter()
                            .filter_map(|data| {
                                if data == "[DONE]" {
                                    return Some(Ok(StreamEvent::Done));
                                }
                                serde_json::from_str::<Value>(&data)
                                    .ok()
                                    .and_then(|v| parse_chunk(&v))
                                    .map(Ok)
                            })
                            .collect()
                    }
                    Err(e) => vec![Err(RuntimeError::provider("openai stream failed")
                        .retryable(true)
                        .caused_by(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Convert the canonical history into the flat wire format.
pub(crate) fn build_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::System => json!({ "role": "system", "content": m.content }),
            Role::User => json!({ "role": "user", "content": m.content }),
            Role::Assistant => {
                if m.tool_calls.is_empty() {
                    json!({ "role": "assistant", "content": m.content })
                } else {
                    let calls: Vec<Value> = m
                        .tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": { "name": c.name, "arguments": c.arguments },
                            })
                        })
                        .collect();
                    let mut v = json!({ "role": "assistant", "tool_calls": calls });
                    if !m.content.is_empty() {
                        v["content"] = json!(m.content);
                    }
                    v
                }
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
                "content": m.content,
            }),
        })
        .collect()
}

/// Parse one SSE chunk.  Returns `None` for empty deltas.
pub(crate) fn parse_chunk(v: &Value) -> Option<StreamEvent> {
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        let cache_read = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0) as u32;
        return Some(StreamEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens: cache_read,
            cache_write_tokens: 0,
        });
    }

    let delta = &v["choices"][0]["delta"];

    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return Some(StreamEvent::ToolCallDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        });
    }

    // Reasoning deltas arrive as `reasoning_content` or `reasoning`
    // depending on the gateway; both carry the same semantics.
    let reasoning = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(r) = reasoning {
        if !r.is_empty() {
            return Some(StreamEvent::ReasoningDelta(r.to_string()));
        }
    }

    let text = delta.get("content").and_then(|c| c.as_str()).unwrap_or("");
    (!text.is_empty()).then(|| StreamEvent::TextDelta(text.to_string()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::TRUNCATED_RESULT;
    use crate::types::ToolCall;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: r#"{"x":1}"#.into(),
        }
    }

    // ── Wire building ─────────────────────────────────────────────────────────

    #[test]
    fn assistant_tool_calls_become_array() {
        let messages = vec![
            ChatMessage::assistant_with_calls("", vec![call("t1", "glob"), call("t2", "grep")]),
            ChatMessage::tool_result("t1", "glob", "a"),
            ChatMessage::tool_result("t2", "grep", "b"),
        ];
        let wire = build_messages(&messages);
        assert_eq!(wire.len(), 3);
        let calls = wire[0]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["id"], "t1");
        assert_eq!(calls[0]["function"]["name"], "glob");
        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "t1");
        assert_eq!(wire[2]["tool_call_id"], "t2");
    }

    #[test]
    fn arguments_forwarded_as_raw_json_string() {
        let wire = build_messages(&[ChatMessage::assistant_with_calls(
            "",
            vec![call("t1", "shell")],
        )]);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["arguments"], r#"{"x":1}"#);
    }

    #[test]
    fn system_prompt_stays_a_flat_message() {
        let wire = build_messages(&[
            ChatMessage::system("be terse"),
            ChatMessage::user("hi"),
        ]);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[0]["content"], "be terse");
    }

    #[test]
    fn orphan_tool_use_repaired_with_placeholder() {
        // The scenario the upstream API rejects outright: a tool call with no
        // result before the next assistant turn.
        let messages = repair_history(
            vec![
                ChatMessage::user("do X"),
                ChatMessage::assistant_with_calls("", vec![call("t1", "shell")]),
                ChatMessage::assistant("done"),
            ],
            RepairStyle::Placeholder,
        );
        let wire = build_messages(&messages);
        let tool_pos = wire.iter().position(|m| m["role"] == "tool").unwrap();
        assert_eq!(wire[tool_pos]["content"], TRUNCATED_RESULT);
        assert_eq!(wire[tool_pos]["tool_call_id"], "t1");
        assert!(
            wire[tool_pos - 1]["tool_calls"].is_array(),
            "placeholder must directly follow the carrier"
        );
    }

    #[test]
    fn sampling_rejected_for_reasoning_models() {
        assert!(rejects_sampling("o3-mini"));
        assert!(rejects_sampling("gpt-5"));
        assert!(!rejects_sampling("gpt-4o"));
    }

    // ── Chunk parsing ─────────────────────────────────────────────────────────

    #[test]
    fn text_delta_parsed() {
        let v = json!({ "choices": [{ "delta": { "content": "hello" } }] });
        assert!(matches!(parse_chunk(&v), Some(StreamEvent::TextDelta(t)) if t == "hello"));
    }

    #[test]
    fn empty_delta_skipped() {
        let v = json!({ "choices": [{ "delta": {} }] });
        assert!(parse_chunk(&v).is_none());
    }

    #[test]
    fn tool_call_delta_keeps_index() {
        let v = json!({
            "choices": [{ "delta": { "tool_calls": [{
                "index": 1,
                "id": "call_xyz",
                "function": { "name": "read_file", "arguments": "" }
            }]}}]
        });
        match parse_chunk(&v) {
            Some(StreamEvent::ToolCallDelta { index, id, name, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(id, "call_xyz");
                assert_eq!(name, "read_file");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn argument_fragments_preserved_verbatim() {
        let v = json!({
            "choices": [{ "delta": { "tool_calls": [{
                "index": 0,
                "function": { "arguments": "{\"cmd\": " }
            }]}}]
        });
        match parse_chunk(&v) {
            Some(StreamEvent::ToolCallDelta { arguments, .. }) => {
                assert_eq!(arguments, "{\"cmd\": ");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn usage_chunk_parsed_with_cached_tokens() {
        let v = json!({
            "usage": {
                "prompt_tokens": 200,
                "completion_tokens": 40,
                "prompt_tokens_details": { "cached_tokens": 150 }
            }
        });
        match parse_chunk(&v) {
            Some(StreamEvent::Usage {
                input_tokens,
                output_tokens,
                cache_read_tokens,
                ..
            }) => {
                assert_eq!(input_tokens, 200);
                assert_eq!(output_tokens, 40);
                assert_eq!(cache_read_tokens, 150);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn null_usage_falls_through_to_delta() {
        let v = json!({ "usage": null, "choices": [{ "delta": { "content": "hi" } }] });
        assert!(matches!(parse_chunk(&v), Some(StreamEvent::TextDelta(t)) if t == "hi"));
    }

    #[test]
    fn reasoning_content_becomes_reasoning_delta() {
        let v = json!({ "choices": [{ "delta": { "reasoning_content": "thinking..." } }] });
        assert!(
            matches!(parse_chunk(&v), Some(StreamEvent::ReasoningDelta(t)) if t == "thinking...")
        );
    }

    #[test]
    fn reasoning_field_fallback() {
        let v = json!({ "choices": [{ "delta": { "reasoning": "hmm", "content": "" } }] });
        assert!(matches!(parse_chunk(&v), Some(StreamEvent::ReasoningDelta(t)) if t == "hmm"));
    }
}
