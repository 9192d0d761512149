// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Output streams.
//!
//! - `text`: plain tokens concatenated on stdout; tool activity to stderr so
//!   the stdout pipeline stays clean.
//! - `stream-json`: newline-delimited JSON events on stdout.
//! - `json`: a single terminal JSON document with the full transcript.

use std::io::Write;

use serde_json::json;

use gro_config::OutputFormat;
use gro_core::AgentEvent;

pub struct OutputWriter {
    format: OutputFormat,
    /// Transcript accumulator for `json` mode.
    transcript: Vec<serde_json::Value>,
    final_text: String,
}

impl OutputWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            transcript: Vec::new(),
            final_text: String::new(),
        }
    }

    pub fn handle(&mut self, event: &AgentEvent) {
        match self.format {
            OutputFormat::Text => self.handle_text(event),
            OutputFormat::StreamJson => self.handle_stream_json(event),
            OutputFormat::Json => self.accumulate(event),
        }
    }

    fn handle_text(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::TextDelta(t) => {
                print!("{t}");
                let _ = std::io::stdout().flush();
            }
            AgentEvent::ToolCallStarted { name, arguments, .. } => {
                eprintln!("[gro:tool] {name} {arguments}");
            }
            AgentEvent::ToolCallFinished {
                name,
                output,
                is_error,
                ..
            } => {
                let tag = if *is_error { "tool:error" } else { "tool:done" };
                let preview: String = output.chars().take(160).collect();
                eprintln!("[gro:{tag}] {name}: {preview}");
            }
            AgentEvent::Compacted { page_ids } => {
                eprintln!("[gro:memory] compacted into {}", page_ids.join(", "));
            }
            AgentEvent::Nudge(text) => {
                eprintln!("[gro:nudge] {text}");
            }
            AgentEvent::TurnComplete { text } => {
                self.final_text = text.clone();
                if !text.is_empty() && !text.ends_with('\n') {
                    println!();
                }
            }
            AgentEvent::ReasoningDelta(_) | AgentEvent::UsageReport { .. } => {}
        }
    }

    fn handle_stream_json(&mut self, event: &AgentEvent) {
        let value = match event {
            AgentEvent::TextDelta(t) => Some(json!({ "type": "token", "payload": t })),
            AgentEvent::ToolCallStarted { name, arguments, .. } => Some(json!({
                "type": "tool_call",
                "name": name,
                "args": arguments,
            })),
            AgentEvent::ToolCallFinished { name, output, .. } => Some(json!({
                "type": "tool_result",
                "name": name,
                "result": output,
            })),
            AgentEvent::TurnComplete { text } => {
                self.final_text = text.clone();
                Some(json!({ "type": "result", "text": text }))
            }
            _ => None,
        };
        if let Some(v) = value {
            println!("{v}");
            let _ = std::io::stdout().flush();
        }
    }

    fn accumulate(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::TextDelta(_) | AgentEvent::ReasoningDelta(_) => {}
            AgentEvent::ToolCallStarted { call_id, name, arguments } => {
                self.transcript.push(json!({
                    "type": "tool_call",
                    "id": call_id,
                    "name": name,
                    "args": arguments,
                }));
            }
            AgentEvent::ToolCallFinished { call_id, name, output, is_error } => {
                self.transcript.push(json!({
                    "type": "tool_result",
                    "id": call_id,
                    "name": name,
                    "result": output,
                    "is_error": is_error,
                }));
            }
            AgentEvent::Compacted { page_ids } => {
                self.transcript.push(json!({ "type": "compaction", "pages": page_ids }));
            }
            AgentEvent::UsageReport { usage, total_usd } => {
                self.transcript.push(json!({
                    "type": "usage",
                    "input": usage.input_tokens,
                    "output": usage.output_tokens,
                    "cache_read": usage.cache_read_tokens,
                    "cache_write": usage.cache_write_tokens,
                    "total_usd": total_usd,
                }));
            }
            AgentEvent::Nudge(text) => {
                self.transcript.push(json!({ "type": "nudge", "text": text }));
            }
            AgentEvent::TurnComplete { text } => {
                self.final_text = text.clone();
                self.transcript.push(json!({ "type": "result", "text": text }));
            }
        }
    }

    /// Emit the terminal document (`json` mode); no-op otherwise.
    pub fn finish(&mut self) {
        if self.format == OutputFormat::Json {
            let doc = json!({
                "text": self.final_text,
                "transcript": self.transcript,
            });
            println!("{doc}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
