// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Indefinite retry for sustained outages.
//!
//! The driver-level retry engine gives up after a handful of attempts; this
//! wrapper sits above it and keeps retrying connection-class failures with a
//! capped, jittered backoff until the network comes back or the operator
//! cancels.  Non-connection errors are rethrown immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::cancel::CancelSignal;
use crate::error::{is_connection_error, RuntimeError};

const INITIAL_DELAY: Duration = Duration::from_secs(5);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Invoke `f` until it succeeds, fails with a non-connection error, or the
/// cancellation signal fires.
pub async fn with_connection_recovery<T, F, Fut>(
    mut f: F,
    cancel: &CancelSignal,
) -> Result<T, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let mut delay = INITIAL_DELAY;
    loop {
        if cancel.is_cancelled() {
            return Err(RuntimeError::aborted());
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_aborted() => return Err(e),
            Err(e) if is_connection_error(&e) => {
                let jitter =
                    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..0.25) * delay.as_secs_f64());
                let wait = delay + jitter;
                warn!(
                    error = %e,
                    wait_secs = wait.as_secs(),
                    "connection failure; retrying after backoff"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RuntimeError::aborted()),
                    _ = tokio::time::sleep(wait) => {}
                }
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn success_passes_through() {
        let out = with_connection_recovery(
            || async { Ok::<_, RuntimeError>(42) },
            &CancelSignal::never(),
        )
        .await
        .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn non_connection_error_rethrown_immediately() {
        let calls = AtomicU32::new(0);
        let err = with_connection_recovery(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RuntimeError::provider_status(400, "invalid request"))
            },
            &CancelSignal::never(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, Some(400));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "must not retry 4xx");
    }

    #[tokio::test(start_paused = true)]
    async fn connection_error_retried_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_connection_recovery(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(RuntimeError::provider("tcp connect: connection refused (ECONNREFUSED)")
                        .retryable(true))
                } else {
                    Ok("recovered")
                }
            },
            &CancelSignal::never(),
        )
        .await
        .unwrap();
        assert_eq!(out, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_aborts_before_first_call() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let err = with_connection_recovery(
            || async { Ok::<_, RuntimeError>(()) },
            &signal,
        )
        .await
        .unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_during_backoff() {
        let (handle, signal) = cancel_pair();
        let task = tokio::spawn(async move {
            with_connection_recovery(
                || async {
                    Err::<(), _>(
                        RuntimeError::provider("connection reset by peer").retryable(true),
                    )
                },
                &signal,
            )
            .await
        });
        // Let the first failure land and the backoff start, then cancel.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_aborted());
    }
}
