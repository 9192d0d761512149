// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Retry policy for provider HTTP calls.
//!
//! Both the attempt cap and the backoff base are read from the environment on
//! every call so live tuning takes effect without a restart.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_MS: u64 = 1000;

/// Hard ceiling on a single backoff delay.
const MAX_DELAY_MS: u64 = 30_000;

/// HTTP status codes worth retrying: rate limits, bad gateways, overload.
pub fn is_retryable(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 529)
}

/// Maximum attempts, overridable via `GRO_MAX_RETRIES`.
pub fn max_attempts() -> u32 {
    std::env::var("GRO_MAX_RETRIES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_ATTEMPTS)
}

/// Backoff base in milliseconds, overridable via `GRO_RETRY_BASE_MS`.
pub fn base_ms() -> u64 {
    std::env::var("GRO_RETRY_BASE_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_BASE_MS)
}

/// Compute the delay before retry number `attempt` (0-based).
///
/// A positive `Retry-After` hint from the server wins; otherwise
/// `base × 2^attempt` plus uniform jitter in `[0, base/2)`.  Capped at 30 s.
pub fn delay(attempt: u32, retry_after_secs: Option<f64>) -> Duration {
    if let Some(secs) = retry_after_secs {
        if secs > 0.0 && secs.is_finite() {
            let ms = (secs * 1000.0).min(MAX_DELAY_MS as f64) as u64;
            return Duration::from_millis(ms);
        }
    }
    let base = base_ms() as f64;
    let exp = base * 2f64.powi(attempt.min(16) as i32);
    let jitter = rand::thread_rng().gen_range(0.0..(base / 2.0).max(1.0));
    Duration::from_millis(((exp + jitter) as u64).min(MAX_DELAY_MS))
}

/// Sleep for the computed delay.
pub async fn wait(attempt: u32, retry_after_secs: Option<f64>) {
    tokio::time::sleep(delay(attempt, retry_after_secs)).await;
}

/// Extract a `Retry-After` hint (in seconds) from response headers.
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<f64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
