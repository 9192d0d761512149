// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::cancel::CancelSignal;
use crate::error::RuntimeError;
use crate::sse::YieldBudget;
use crate::types::{ChatOutput, ChatRequest, StreamEvent, ToolCall, Usage};

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<StreamEvent, RuntimeError>> + Send>>;

/// A streaming chat driver for one wire dialect.
///
/// Drivers hold no state between calls beyond small process-wide caches
/// (model capability and thinking-rejection sets).
#[async_trait]
pub trait ChatDriver: Send + Sync {
    /// Stable provider id for status display and error metadata.
    fn name(&self) -> &str;

    /// Model identifier used when the request carries no override.
    fn model_name(&self) -> &str;

    /// Send a completion request and return the event stream.
    ///
    /// The driver performs history repair, wire translation, and bounded
    /// retries internally; sustained outages surface as connection-class
    /// errors for the recovery wrapper above.
    async fn chat(&self, req: ChatRequest) -> Result<ResponseStream, RuntimeError>;
}

/// Per-index accumulator state for a streamed tool call.
#[derive(Debug, Default, Clone)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds stream events into a [`ChatOutput`].
///
/// Tool-call argument fragments are joined per index and validated only at
/// [`OutputAccumulator::finish`]; partial or invalid JSON falls back to `{}`.
#[derive(Debug, Default)]
pub struct OutputAccumulator {
    text: String,
    reasoning: String,
    calls: BTreeMap<u32, PartialCall>,
    usage: Usage,
}

impl OutputAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(t) => self.text.push_str(t),
            StreamEvent::ReasoningDelta(t) => self.reasoning.push_str(t),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let slot = self.calls.entry(*index).or_default();
                if !id.is_empty() {
                    slot.id = id.clone();
                }
                if !name.is_empty() {
                    slot.name = name.clone();
                }
                slot.arguments.push_str(arguments);
            }
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
                cache_read_tokens,
                cache_write_tokens,
            } => {
                self.usage.merge(&Usage {
                    input_tokens: *input_tokens,
                    output_tokens: *output_tokens,
                    cache_read_tokens: *cache_read_tokens,
                    cache_write_tokens: *cache_write_tokens,
                });
            }
            StreamEvent::Done => {}
        }
    }

    pub fn finish(self) -> ChatOutput {
        let tool_calls = self
            .calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let arguments = match serde_json::from_str::<serde_json::Value>(&c.arguments) {
                    Ok(_) if !c.arguments.trim().is_empty() => c.arguments,
                    _ => "{}".to_string(),
                };
                ToolCall {
                    id: c.id,
                    name: c.name,
                    arguments,
                }
            })
            .collect();
        ChatOutput {
            text: self.text,
            reasoning: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
            tool_calls,
            usage: self.usage,
        }
    }
}

/// Consume a driver stream into a [`ChatOutput`], invoking `on_event` per
/// event and yielding cooperatively so the host scheduler keeps making
/// progress during long streams.
pub async fn collect_output(
    mut stream: ResponseStream,
    mut on_event: impl FnMut(&StreamEvent) + Send,
    cancel: &CancelSignal,
) -> Result<ChatOutput, RuntimeError> {
    let mut acc = OutputAccumulator::new();
    let mut budget = YieldBudget::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RuntimeError::aborted()),
            item = stream.next() => item,
        };
        match next {
            None => break,
            Some(Err(e)) => return Err(e),
            Some(Ok(event)) => {
                let cost = match &event {
                    StreamEvent::TextDelta(t) | StreamEvent::ReasoningDelta(t) => t.len(),
                    StreamEvent::ToolCallDelta { arguments, .. } => arguments.len(),
                    _ => 0,
                };
                on_event(&event);
                let done = matches!(event, StreamEvent::Done);
                acc.apply(&event);
                if done {
                    break;
                }
                budget.tick(cost.max(1)).await;
            }
        }
    }
    Ok(acc.finish())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
