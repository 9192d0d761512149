// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
use gro_model::Usage;

/// Events emitted by the scheduler during a turn.  Consumers (the CLI output
/// writers) subscribe to these to drive their streams.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// A reasoning chunk from the model.
    ReasoningDelta(String),
    /// The model requested a tool call.
    ToolCallStarted {
        call_id: String,
        name: String,
        arguments: String,
    },
    /// A tool call finished.
    ToolCallFinished {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// Memory compacted; page ids created.
    Compacted { page_ids: Vec<String> },
    /// Usage and running cost after one completion round.
    UsageReport { usage: Usage, total_usd: f64 },
    /// A scheduler nudge was injected (cooperative contract, fairness).
    Nudge(String),
    /// The model's final text for this turn (directives stripped).
    TurnComplete { text: String },
}
