// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Runtime core: directive parsing, runtime state, sensors, the turn
//! scheduler, and session persistence.

pub mod directive;
pub mod events;
pub mod learn;
pub mod scheduler;
pub mod sensors;
pub mod session;
pub mod state;
pub mod tools;

pub use directive::{apply_order, parse, Directive, ParsedOutput};
pub use events::AgentEvent;
pub use scheduler::{
    CostMeter, CostRates, DriverSummarizer, Scheduler, SchedulerConfig, SessionStatus, TurnReport,
};
pub use sensors::{DejaVu, Familiarity};
pub use session::{
    latest_session, learn_file, list_sessions, load_session, pages_dir, sanitize_tool_pairs,
    save_session, sessions_dir, state_root, SessionMeta,
};
pub use state::RuntimeState;
pub use tools::{
    is_listen_tool, PageSearchTool, ToolHandler, ToolOrigin, ToolOutcome, ToolRegistry,
};
