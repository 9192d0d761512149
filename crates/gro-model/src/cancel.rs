// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Cancellation plumbing.
//!
//! One [`CancelHandle`] is held by the operator-facing side; any number of
//! cloned [`CancelSignal`]s descend through the scheduler into drivers and
//! fetches.  Awaits linked to the signal resolve to an "aborted" error.

use tokio::sync::watch;

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a linked handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelSignal {
    /// A signal that never fires.  Useful for tests and one-shot CLI runs
    /// where cancellation is driven by process signals instead.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender closes the channel; `cancelled()` then pends
        // forever, which is exactly the "never" behaviour.
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the handle fires.  Pends forever if the handle was
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without a cancel: never resolves.
                std::future::pending::<()>().await;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
