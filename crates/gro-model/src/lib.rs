// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Canonical message model and provider adaptation layer.
//!
//! Three wire dialects share one canonical conversation model; the drivers
//! translate, stream, and repair so every request satisfies the target API's
//! pairing and alternation invariants.

pub mod cancel;
pub mod error;
pub mod fetch;
pub mod rate_limit;
pub mod recovery;
pub mod repair;
pub mod retry;
pub mod thinking;
pub mod tiers;

mod anthropic;
mod google;
mod mock;
mod openai;
mod provider;
mod sse;
mod types;

pub use anthropic::AnthropicDriver;
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use error::{is_connection_error, ErrorKind, RuntimeError};
pub use google::GoogleDriver;
pub use mock::ScriptedDriver;
pub use openai::OpenAiDriver;
pub use provider::{collect_output, ChatDriver, OutputAccumulator, ResponseStream};
pub use types::*;

use gro_config::ModelConfig;

/// Construct a boxed [`ChatDriver`] from configuration.
///
/// API keys are resolved inside each driver at call time (explicit config
/// value first, then the provider env var) so live overrides take effect.
pub fn from_config(cfg: &ModelConfig) -> Result<Box<dyn ChatDriver>, RuntimeError> {
    match cfg.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicDriver::new(
            cfg.name.clone(),
            cfg.api_key.clone(),
            cfg.base_url.clone(),
        ))),
        "openai" => Ok(Box::new(OpenAiDriver::new(
            cfg.name.clone(),
            cfg.api_key.clone(),
            cfg.base_url.clone(),
        ))),
        "google" => Ok(Box::new(GoogleDriver::new(
            cfg.name.clone(),
            cfg.api_key.clone(),
            cfg.base_url.clone(),
        ))),
        "mock" => Ok(Box::new(ScriptedDriver::new(Vec::new()))),
        other => Err(RuntimeError::config(format!(
            "unknown model provider: {other:?} (expected anthropic | openai | google | mock)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            name: "test-model".into(),
            api_key: None,
            base_url: None,
        }
    }

    #[test]
    fn from_config_builds_all_known_providers() {
        for provider in ["anthropic", "openai", "google", "mock"] {
            let driver = from_config(&cfg(provider)).unwrap();
            assert_eq!(driver.name(), provider);
        }
    }

    #[test]
    fn from_config_rejects_unknown_provider() {
        let err = match from_config(&cfg("quantumlab")) {
            Err(e) => e,
            Ok(_) => panic!("expected unknown provider to be rejected"),
        };
        assert_eq!(err.kind, ErrorKind::Config);
        assert!(err.message.contains("quantumlab"));
    }
}
