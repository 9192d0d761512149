// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Token-bucket fairness across named lanes.
//!
//! Each lane tracks a monotonically advancing "next available" instant.
//! A caller reserves its slot under the lane lock, then sleeps outside it,
//! so concurrent callers for the same lane are granted strictly ordered
//! slots while different lanes stay independent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::RuntimeError;

#[derive(Default)]
pub struct RateLimiter {
    lanes: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the named lane permits another call at `rate_per_second`.
    ///
    /// Rejects non-positive and non-finite rates with a config error.
    pub async fn limit(&self, name: &str, rate_per_second: f64) -> Result<(), RuntimeError> {
        if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
            return Err(RuntimeError::config(format!(
                "invalid rate {rate_per_second} for lane {name:?}"
            )));
        }
        let interval = Duration::from_secs_f64(1.0 / rate_per_second);
        let slot = {
            let mut lanes = self.lanes.lock().expect("rate limiter lock");
            let now = Instant::now();
            let next = lanes.entry(name.to_string()).or_insert(now);
            let slot = (*next).max(now);
            *next = slot + interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_rates_rejected() {
        let rl = RateLimiter::new();
        assert!(rl.limit("a", 0.0).await.is_err());
        assert!(rl.limit("a", -1.0).await.is_err());
        assert!(rl.limit("a", f64::NAN).await.is_err());
        assert!(rl.limit("a", f64::INFINITY).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn lane_rate_bounds_completions() {
        let rl = RateLimiter::new();
        // 10 calls at 5/s: first is immediate, the rest are spaced 200 ms
        // apart, so the batch takes 1.8 s of virtual time.
        let start = Instant::now();
        for _ in 0..10 {
            rl.limit("chat", 5.0).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(1800),
            "10 calls at 5/s must span >= 1.8s, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lanes_are_independent() {
        let rl = RateLimiter::new();
        rl.limit("a", 1.0).await.unwrap();
        let start = Instant::now();
        // A fresh lane must not inherit lane "a"'s backlog.
        rl.limit("b", 1.0).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_serialized_per_lane() {
        use std::sync::Arc;
        let rl = Arc::new(RateLimiter::new());
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let rl = Arc::clone(&rl);
            handles.push(tokio::spawn(async move {
                rl.limit("shared", 2.0).await.unwrap();
                Instant::now()
            }));
        }
        let mut finish: Vec<Instant> = Vec::new();
        for h in handles {
            finish.push(h.await.unwrap());
        }
        finish.sort();
        // 4 callers at 2/s: last completion at least 1.5 s after the first.
        assert!(
            finish[3].duration_since(start) >= Duration::from_millis(1500),
            "slots must be spaced at the lane rate"
        );
    }
}
