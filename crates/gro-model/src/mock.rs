// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Scripted driver for deterministic tests.
//!
//! Each call pops the next scripted [`ChatOutput`] and replays it as a
//! stream: one text delta, one tool-call delta per call, usage, done.  When
//! the script runs out it replies with a canned empty turn, which ends any
//! scheduler loop.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::ResponseStream;
use crate::types::{ChatOutput, ChatRequest, StreamEvent, ToolCall, Usage};
use crate::RuntimeError;

#[derive(Default)]
pub struct ScriptedDriver {
    script: Mutex<Vec<ChatOutput>>,
    /// Requests observed, newest last.  Tests inspect these to assert on
    /// repair results and injected nudges.
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedDriver {
    pub fn new(mut outputs: Vec<ChatOutput>) -> Self {
        outputs.reverse(); // pop() takes from the back
        Self {
            script: Mutex::new(outputs),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a scripted text-only reply.
    pub fn text_reply(text: impl Into<String>) -> ChatOutput {
        ChatOutput {
            text: text.into(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Usage::default()
            },
            ..ChatOutput::default()
        }
    }

    /// Convenience: a scripted reply that calls one tool.
    pub fn tool_reply(id: &str, name: &str, arguments: &str) -> ChatOutput {
        ChatOutput {
            tool_calls: vec![ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: arguments.into(),
            }],
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Usage::default()
            },
            ..ChatOutput::default()
        }
    }
}

#[async_trait]
impl crate::ChatDriver for ScriptedDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, req: ChatRequest) -> Result<ResponseStream, RuntimeError> {
        self.requests.lock().expect("requests lock").push(req);
        let output = self
            .script
            .lock()
            .expect("script lock")
            .pop()
            .unwrap_or_default();

        let mut events: Vec<Result<StreamEvent, RuntimeError>> = Vec::new();
        if let Some(reasoning) = &output.reasoning {
            events.push(Ok(StreamEvent::ReasoningDelta(reasoning.clone())));
        }
        if !output.text.is_empty() {
            events.push(Ok(StreamEvent::TextDelta(output.text.clone())));
        }
        for (i, call) in output.tool_calls.iter().enumerate() {
            events.push(Ok(StreamEvent::ToolCallDelta {
                index: i as u32,
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            }));
        }
        events.push(Ok(StreamEvent::Usage {
            input_tokens: output.usage.input_tokens,
            output_tokens: output.usage.output_tokens,
            cache_read_tokens: output.usage.cache_read_tokens,
            cache_write_tokens: output.usage.cache_write_tokens,
        }));
        events.push(Ok(StreamEvent::Done));

        Ok(Box::pin(futures::stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
