// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Server-sent-events plumbing shared by the drivers.
//!
//! SSE lines can be split across TCP chunks, so a remainder buffer is carried
//! forward between chunks; only complete `\n`-terminated lines are surfaced.

use std::time::{Duration, Instant};

/// Drain every complete `data:` payload from `buf`.
///
/// The trailing incomplete line (bytes not yet terminated by `\n`) is left in
/// `buf` so the next TCP chunk can extend it.  Comment lines and non-`data`
/// fields are skipped; blank lines (event separators) are consumed.
pub(crate) fn drain_sse_data(buf: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line = buf[..pos].trim_end_matches('\r').to_string();
        buf.drain(..=pos);
        if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            let data = data.trim();
            if !data.is_empty() {
                out.push(data.to_string());
            }
        }
    }
    out
}

/// Cooperative-yield bookkeeping for stream consumers.
///
/// The decoder must not starve the host scheduler: after roughly 1 KB of
/// streamed data or 8 ms of wall clock (whichever comes first) the consumer
/// yields back to the runtime.
pub struct YieldBudget {
    bytes: usize,
    last_yield: Instant,
}

const YIELD_BYTES: usize = 1024;
const YIELD_INTERVAL: Duration = Duration::from_millis(8);

impl YieldBudget {
    pub fn new() -> Self {
        Self {
            bytes: 0,
            last_yield: Instant::now(),
        }
    }

    /// Account `bytes` of processed data and yield if the budget is spent.
    pub async fn tick(&mut self, bytes: usize) {
        self.bytes += bytes;
        if self.bytes >= YIELD_BYTES || self.last_yield.elapsed() >= YIELD_INTERVAL {
            self.bytes = 0;
            self.last_yield = Instant::now();
            tokio::task::yield_now().await;
        }
    }
}

impl Default for YieldBudget {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
