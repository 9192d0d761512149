// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages driver (block-content dialect).
//!
//! Tool invocations and results travel as typed content blocks inside
//! user/assistant turns, the system prompt is an ordered list of text blocks
//! with bounded cache-control markers, and user/assistant turns must strictly
//! alternate.

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
    types::{source, ChatMessage, ChatRequest, Role, StreamEvent, ToolSchema},
    RuntimeError,
};

/// Dialect limit on cache-control breakpoints per request.
const MAX_CACHE_BREAKPOINTS: usize = 4;

/// Breakpoints reserved for the tools array (the remainder goes to the most
/// stable prefix of the system blocks).
const TOOL_CACHE_BREAKPOINTS: usize = 1;

pub struct AnthropicDriver {
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicDriver {
    pub fn new(model: String, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }

    /// Key resolution happens per call so live env overrides take effect.
    fn resolve_key(&self) -> Result<String, RuntimeError> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| RuntimeError::config("ANTHROPIC_API_KEY not set"))
    }
}

#[async_trait]
impl crate::ChatDriver for AnthropicDriver {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, req: ChatRequest) -> Result<ResponseStream, RuntimeError> {
        let key = self.resolve_key()?;
        let model = req.model.clone().unwrap_or_else(|| self.model.clone());
        let messages = repair_history(req.messages.clone(), RepairStyle::Strip);

        let system = build_system_blocks(&messages, req.enable_caching);
        let conversation = build_conversation(&messages);
        let tools = build_tools(&req.tools, req.enable_caching);

        let mut body = json!({
            "model": model,
            "messages": conversation,
            "max_tokens": req.max_tokens,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        let strategy = strategy_for("anthropic", &model, req.thinking_budget, req.max_tokens);
        let thinking_enabled = if let ThinkingStrategy::Manual { budget_tokens } = strategy {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget_tokens });
            true
        } else {
            false
        };
        // Extended thinking forbids sampling overrides; otherwise apply them.
        if !thinking_enabled {
            if let Some(t) = req.sampling.temperature {
                body["temperature"] = json!(t);
            }
            if let Some(p) = req.sampling.top_p {
                body["top_p"] = json!(p);
            }
            if let Some(k) = req.sampling.top_k {
                body["top_k"] = json!(k);
            }
        }

        debug!(
            model = %model,
            messages = conversation_len(&body),
            tools = req.tools.len(),
            thinking = thinking_enabled,
            "sending anthropic request"
        );

        let headers = vec![
            ("x-api-key".to_string(), key),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
        ];
        let strip: Option<fn(&mut Value)> = if thinking_enabled {
            Some(|b: &mut Value| {
                if let Some(o) = b.as_object_mut() {
                    o.remove("thinking");
                }
            })
        } else {
            None
        };
        let resp = post_chat_with_retry(
            &self.client,
            &format!("{}/v1/messages", self.base_url.trim_end_matches('/')),
            &headers,
            &mut body,
            "anthropic",
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
                                serde_json::from_str::<Value>(&data)
                                    .ok()
                                    .and_then(|v| parse_event(&v))
                                    .map(Ok)
                            })
                            .collect()
                    }
                    Err(e) => vec![Err(RuntimeError::provider("anthropic stream failed")
                        .retryable(true)
                        .caused_by(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Stability class of a system message: lower sorts earlier and caches first.
fn stability_class(m: &ChatMessage) -> u8 {
    match m.from_tag() {
        Some(source::SYSTEM) | None => 0,
        Some(source::VIRTUAL_MEMORY) => 1,
        Some(_) => 2,
    }
}

/// Assemble the `system` array: text blocks sorted by stability with
/// cache-control markers on the most stable prefix.
pub(crate) fn build_system_blocks(messages: &[ChatMessage], enable_caching: bool) -> Vec<Value> {
    let mut system: Vec<&ChatMessage> = messages
        .iter()
        .filter(|m| m.role == Role::System && !m.content.is_empty())
        .collect();
    system.sort_by_key(|m| stability_class(m));

    let cacheable = MAX_CACHE_BREAKPOINTS - TOOL_CACHE_BREAKPOINTS;
    system
        .iter()
        .enumerate()
        .map(|(i, m)| {
            if enable_caching && i < cacheable {
                json!({
                    "type": "text",
                    "text": m.content,
                    "cache_control": { "type": "ephemeral" },
                })
            } else {
                json!({ "type": "text", "text": m.content })
            }
        })
        .collect()
}

/// Convert non-system messages into the wire conversation, merging adjacent
/// same-role turns so user/assistant strictly alternate.
pub(crate) fn build_conversation(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for m in messages {
        let (role, blocks) = match m.role {
            Role::System => continue,
            Role::User => (
                "user",
                vec![json!({ "type": "text", "text": m.content })],
            ),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": m.content }));
                }
                for c in &m.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": c.id,
                        "name": c.name,
                        "input": serde_json::from_str::<Value>(&c.arguments)
                            .unwrap_or_else(|_| json!({})),
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({ "type": "text", "text": "" }));
                }
                ("assistant", blocks)
            }
            Role::Tool => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.content,
                })],
            ),
        };
        match out.last_mut() {
            Some(prev) if prev["role"] == role => {
                let existing = prev["content"].as_array_mut().expect("content array");
                existing.extend(blocks);
            }
            _ => out.push(json!({ "role": role, "content": blocks })),
        }
    }
    out
}

/// Tool definitions, with the reserved cache breakpoint on the last entry so
/// the whole array caches as one prefix.
pub(crate) fn build_tools(tools: &[ToolSchema], enable_caching: bool) -> Vec<Value> {
    let last = tools.len().saturating_sub(1);
    tools
        .iter()
        .enumerate()
        .map(|(i, t)| {
            if enable_caching && i == last {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                    "cache_control": { "type": "ephemeral" },
                })
            } else {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            }
        })
        .collect()
}

fn conversation_len(body: &Value) -> usize {
    body["messages"].as_array().map(|a| a.len()).unwrap_or(0)
}

/// Map one SSE payload onto a stream event.  Returns `None` for events that
/// carry nothing (pings, signature deltas, empty fragments).
pub(crate) fn parse_event(v: &Value) -> Option<StreamEvent> {
    match v["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                Some(StreamEvent::ToolCallDelta {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                })
            } else {
                None
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("");
                    (!text.is_empty()).then(|| StreamEvent::TextDelta(text.to_string()))
                }
                "input_json_delta" => Some(StreamEvent::ToolCallDelta {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }),
                "thinking_delta" => {
                    let t = delta["thinking"].as_str().unwrap_or("");
                    (!t.is_empty()).then(|| StreamEvent::ReasoningDelta(t.to_string()))
                }
                // signature_delta carries an opaque integrity blob; never
                // surface it as text.
                _ => None,
            }
        }
        "message_start" => v["message"].get("usage").map(|usage| StreamEvent::Usage {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: 0,
            cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32,
            cache_write_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0)
                as u32,
        }),
        "message_delta" => v.get("usage").map(|usage| StreamEvent::Usage {
            input_tokens: 0,
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        }),
        "message_stop" => Some(StreamEvent::Done),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
