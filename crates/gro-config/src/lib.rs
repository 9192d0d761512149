// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Layered configuration for the gro runtime.

mod loader;
mod schema;

pub use loader::load;
pub use schema::{AgentConfig, Config, ModelConfig, OutputFormat, PersistentPolicy};
