// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP POST with timeout, cancellation, and a location tag for diagnostics.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::cancel::CancelSignal;
use crate::error::RuntimeError;

/// Default per-request timeout for completion calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Timeout for tiny control-plane calls (batch signal posts, polls).
pub const SHORT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// POST a JSON body and return the raw response.
///
/// `location` names the call site (e.g. `"anthropic.chat"`) and is embedded
/// in timeout and transport errors so a failure in a log line can be traced
/// without a backtrace.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
    timeout: Duration,
    location: &str,
    cancel: &CancelSignal,
) -> Result<reqwest::Response, RuntimeError> {
    let mut req = client.post(url).json(body);
    for (name, value) in headers {
        req = req.header(name.as_str(), value.as_str());
    }

    let started = Instant::now();
    let send = tokio::time::timeout(timeout, req.send());
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RuntimeError::aborted()),
        outcome = send => match outcome {
            Err(_) => Err(RuntimeError::timeout(format!(
                "fetch timed out after {}s at {location}",
                timeout.as_secs()
            ))
            .with_latency(started.elapsed().as_millis() as u64)),
            Ok(Err(e)) => {
                let retryable = e.is_connect() || e.is_timeout();
                Err(RuntimeError::provider(format!("request failed at {location}"))
                    .retryable(retryable)
                    .with_latency(started.elapsed().as_millis() as u64)
                    .caused_by(e))
            }
            Ok(Ok(resp)) => Ok(resp),
        },
    }
}

/// GET a URL and return the raw response (used by the batch poller).
pub async fn get(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    timeout: Duration,
    location: &str,
    cancel: &CancelSignal,
) -> Result<reqwest::Response, RuntimeError> {
    let mut req = client.get(url);
    for (name, value) in headers {
        req = req.header(name.as_str(), value.as_str());
    }
    let send = tokio::time::timeout(timeout, req.send());
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RuntimeError::aborted()),
        outcome = send => match outcome {
            Err(_) => Err(RuntimeError::timeout(format!(
                "fetch timed out after {}s at {location}",
                timeout.as_secs()
            ))),
            Ok(Err(e)) => {
                let retryable = e.is_connect() || e.is_timeout();
                Err(RuntimeError::provider(format!("request failed at {location}"))
                    .retryable(retryable)
                    .caused_by(e))
            }
            Ok(Ok(resp)) => Ok(resp),
        },
    }
}

/// POST a completion body with the full retry discipline shared by the
/// drivers: bounded retries for retryable statuses and connection failures,
/// plus the thinking-rejection fallback.
///
/// `strip_thinking` is `Some` only when the body carries a reasoning field;
/// on a 4xx naming "thinking"/"not supported" the model is recorded in the
/// process-wide rejection set, the field is removed, and the call is retried
/// immediately without consuming an attempt.
pub(crate) async fn post_chat_with_retry(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    body: &mut Value,
    provider: &str,
    model: &str,
    mut strip_thinking: Option<fn(&mut Value)>,
    cancel: &CancelSignal,
) -> Result<reqwest::Response, RuntimeError> {
    let location = format!("{provider}.chat");
    let max_attempts = crate::retry::max_attempts().max(1);
    let mut attempt = 0u32;
    loop {
        match post_json(
            client,
            url,
            headers,
            body,
            DEFAULT_REQUEST_TIMEOUT,
            &location,
            cancel,
        )
        .await
        {
            Err(e) if e.is_aborted() => return Err(e),
            Err(e) if (e.retryable || crate::error::is_connection_error(&e))
                && attempt + 1 < max_attempts =>
            {
                tracing::warn!(provider, attempt, error = %e, "transport error; retrying");
                crate::retry::wait(attempt, None).await;
                attempt += 1;
            }
            Err(e) => return Err(e.with_provider(provider).with_model(model)),
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status().as_u16();
                let request_id = resp
                    .headers()
                    .get("request-id")
                    .or_else(|| resp.headers().get("x-request-id"))
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let retry_after = crate::retry::retry_after(resp.headers());
                let text = resp.text().await.unwrap_or_default();
                if strip_thinking.is_some()
                    && crate::thinking::is_thinking_rejection(status, &text)
                {
                    tracing::warn!(provider, model, "thinking rejected; retrying without it");
                    crate::thinking::mark_rejected(model);
                    (strip_thinking.take().expect("checked above"))(body);
                    continue;
                }
                if crate::retry::is_retryable(status) && attempt + 1 < max_attempts {
                    tracing::warn!(provider, status, attempt, "retryable status");
                    crate::retry::wait(attempt, retry_after).await;
                    attempt += 1;
                    continue;
                }
                let mut err = RuntimeError::provider_status(
                    status,
                    format!("{provider} error {status}: {text}"),
                )
                .with_provider(provider)
                .with_model(model);
                if let Some(id) = request_id {
                    err = err.with_request_id(id);
                }
                return Err(err);
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
