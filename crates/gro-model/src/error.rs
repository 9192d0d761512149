// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Error taxonomy shared by every runtime component.
//!
//! Each error carries its kind, a retryable flag, and optional provider
//! metadata (model, request id, latency).  The cause chain is preserved by
//! value so errors can cross task boundaries and still be classified later
//! (see [`is_connection_error`]).

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Coarse error classification.  The retryable default per kind follows the
/// propagation policy: provider errors are variable (set from the HTTP
/// class), MCP and timeout errors are retryable, everything else is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Provider,
    Tool,
    Config,
    Mcp,
    Timeout,
    Session,
    Batch,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provider => "provider_error",
            Self::Tool => "tool_error",
            Self::Config => "config_error",
            Self::Mcp => "mcp_error",
            Self::Timeout => "timeout_error",
            Self::Session => "session_error",
            Self::Batch => "batch_error",
        };
        write!(f, "{s}")
    }
}

/// The one error type that crosses component boundaries.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub request_id: Option<String>,
    pub latency_ms: Option<u64>,
    pub status: Option<u16>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl RuntimeError {
    fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            provider: None,
            model: None,
            request_id: None,
            latency_ms: None,
            status: None,
            source: None,
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Provider, message, false)
    }

    /// Provider error classified from an HTTP status code.
    pub fn provider_status(status: u16, message: impl Into<String>) -> Self {
        let mut e = Self::new(
            ErrorKind::Provider,
            message,
            crate::retry::is_retryable(status),
        );
        e.status = Some(status);
        e
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tool, message, false)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message, false)
    }

    pub fn mcp(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Mcp, message, true)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message, true)
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Session, message, false)
    }

    pub fn batch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Batch, message, false)
    }

    /// Error returned by every await that observed the cancellation signal.
    pub fn aborted() -> Self {
        Self::new(ErrorKind::Timeout, "aborted", false)
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Timeout && self.message == "aborted"
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_latency(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach the underlying error, taking ownership of it.
    pub fn caused_by(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Regex matching connection-class failures anywhere in a cause chain.
fn connection_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)econnrefused|econnreset|etimedout|enetunreach|eai_again",
            r"|socket hang ?up|connection (refused|reset|closed|aborted)",
            r"|network unreachable|dns error|timed ?out|broken pipe",
        ))
        .expect("connection regex")
    })
}

/// Walk the cause chain and report whether any link looks like a transient
/// network failure.  Used by the retry engine and the connection-recovery
/// wrapper to distinguish sustained outages from real API rejections.
pub fn is_connection_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let re = connection_regex();
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if re.is_match(&e.to_string()) {
            return true;
        }
        cur = e.source();
    }
    false
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
