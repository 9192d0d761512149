// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Google Gemini driver (structured-parts dialect).
//!
//! Turns are `contents` entries with explicit `functionCall` and
//! `functionResponse` parts, user/model turns must alternate, and the system
//! prompt lives in the top-level `systemInstruction` field.  Responses are
//! matched to calls by function *name*, so an id→name map is carried through
//! the conversion.

use std::collections::HashMap;

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

pub struct GoogleDriver {
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleDriver {
    pub fn new(model: String, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            client: reqwest::Client::new(),
        }
    }

    fn resolve_key(&self) -> Result<String, RuntimeError> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .ok_or_else(|| RuntimeError::config("GEMINI_API_KEY not set"))
    }
}

#[async_trait]
impl crate::ChatDriver for GoogleDriver {
    fn name(&self) -> &str {
        "google"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, req: ChatRequest) -> Result<ResponseStream, RuntimeError> {
        let key = self.resolve_key()?;
        let model = req.model.clone().unwrap_or_else(|| self.model.clone());
        let messages = repair_history(req.messages.clone(), RepairStyle::Strip);

        let (system_parts, contents) = build_contents(&messages);

        let mut generation_config = json!({
            "maxOutputTokens": req.max_tokens,
        });
        if let Some(t) = req.sampling.temperature {
            generation_config["temperature"] = json!(t);
        }
        if let Some(p) = req.sampling.top_p {
            generation_config["topP"] = json!(p);
        }
        if let Some(k) = req.sampling.top_k {
            generation_config["topK"] = json!(k);
        }

        let strategy = strategy_for("google", &model, req.thinking_budget, req.max_tokens);
        let thinking_enabled = if let ThinkingStrategy::Manual { budget_tokens } = strategy {
            generation_config["thinkingConfig"] = json!({ "thinkingBudget": budget_tokens });
            true
        } else {
            false
        };

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }
        if !req.tools.is_empty() {
            let declarations: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        debug!(model = %model, thinking = thinking_enabled, "sending gemini request");

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            model
        );
        let headers = vec![("x-goog-api-key".to_string(), key)];
        let strip: Option<fn(&mut Value)> = if thinking_enabled {
            Some(|b: &mut Value| {
                if let Some(cfg) = b["generationConfig"].as_object_mut() {
                    cfg.remove("thinkingConfig");
                }
            })
        } else {
            None
        };
        let resp = post_chat_with_retry(
            &self.client,
            &url,
            &headers,
            &mut body,
            "google",
            &model,
            strip,
            &req.cancel,
        )
        .await?;

        // functionCall parts arrive whole rather than as fragments; a running
        // counter assigns each one a distinct accumulator index.
        let event_stream = resp
            .bytes_stream()
            .scan((String::new(), 0u32), |state, chunk| {
                let (buf, call_index) = state;
                let events: Vec<Result<StreamEvent, RuntimeError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        let mut events = Vec::new();
                        for data in drain_sse_data(buf) {
                            if let Ok(v) = serde_json::from_str::<Value>(&data) {
                                events.extend(parse_chunk(&v, call_index).into_iter().map(Ok));
                            }
                        }
                        events
                    }
                    Err(e) => vec![Err(RuntimeError::provider("google stream failed")
                        .retryable(true)
                        .caused_by(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        // Gemini has no terminal sentinel; append Done when the byte stream ends.
        let with_done = event_stream.chain(futures::stream::iter(vec![Ok(StreamEvent::Done)]));

        Ok(Box::pin(with_done))
    }
}

/// Split the canonical history into `(system_parts, contents)`.
///
/// Tool results are emitted as `functionResponse` parts on user turns, named
/// via the id→name map collected from earlier assistant calls.  Adjacent
/// same-role turns are merged for the mandatory alternation.
pub(crate) fn build_contents(messages: &[ChatMessage]) -> (Vec<Value>, Vec<Value>) {
    let mut call_names: HashMap<String, String> = HashMap::new();
    for m in messages {
        for c in &m.tool_calls {
            call_names.insert(c.id.clone(), c.name.clone());
        }
    }

    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for m in messages {
        let (role, parts) = match m.role {
            Role::System => {
                if !m.content.is_empty() {
                    system_parts.push(json!({ "text": m.content }));
                }
                continue;
            }
            Role::User => ("user", vec![json!({ "text": m.content })]),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !m.content.is_empty() {
                    parts.push(json!({ "text": m.content }));
                }
                for c in &m.tool_calls {
                    parts.push(json!({
                        "functionCall": {
                            "name": c.name,
                            "args": serde_json::from_str::<Value>(&c.arguments)
                                .unwrap_or_else(|_| json!({})),
                        }
                    }));
                }
                if parts.is_empty() {
                    parts.push(json!({ "text": "" }));
                }
                ("model", parts)
            }
            Role::Tool => {
                let id = m.tool_call_id.clone().unwrap_or_default();
                let name = m
                    .tool_name
                    .clone()
                    .or_else(|| call_names.get(&id).cloned())
                    .unwrap_or(id);
                (
                    "user",
                    vec![json!({
                        "functionResponse": {
                            "name": name,
                            "response": { "output": m.content },
                        }
                    })],
                )
            }
        };
        match contents.last_mut() {
            Some(prev) if prev["role"] == role => {
                prev["parts"]
                    .as_array_mut()
                    .expect("parts array")
                    .extend(parts);
            }
            _ => contents.push(json!({ "role": role, "parts": parts })),
        }
    }
    (system_parts, contents)
}

/// Parse one streamed chunk into zero or more events.
pub(crate) fn parse_chunk(v: &Value, call_index: &mut u32) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    if let Some(parts) = v["candidates"][0]["content"]["parts"].as_array() {
        for part in parts {
            if let Some(fc) = part.get("functionCall") {
                let index = *call_index;
                *call_index += 1;
                events.push(StreamEvent::ToolCallDelta {
                    index,
                    // The dialect has no opaque call ids; synthesize stable ones.
                    id: format!("call_{index}"),
                    name: fc["name"].as_str().unwrap_or("").to_string(),
                    arguments: fc["args"].to_string(),
                });
            } else if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if text.is_empty() {
                    continue;
                }
                if part["thought"].as_bool().unwrap_or(false) {
                    events.push(StreamEvent::ReasoningDelta(text.to_string()));
                } else {
                    events.push(StreamEvent::TextDelta(text.to_string()));
                }
            }
        }
    }

    if let Some(usage) = v.get("usageMetadata") {
        let input = usage["promptTokenCount"].as_u64().unwrap_or(0) as u32;
        let output = usage["candidatesTokenCount"].as_u64().unwrap_or(0) as u32;
        let cached = usage["cachedContentTokenCount"].as_u64().unwrap_or(0) as u32;
        if input > 0 || output > 0 {
            events.push(StreamEvent::Usage {
                input_tokens: input,
                output_tokens: output,
                cache_read_tokens: cached,
                cache_write_tokens: 0,
            });
        }
    }

    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
