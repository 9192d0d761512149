// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Asynchronous batch summarizer.
//!
//! Compaction in batch mode writes pages with placeholder summaries and
//! enqueues jobs here.  The worker submits queued jobs to the provider batch
//! endpoint, polls outstanding batches on a fixed cadence, downloads JSONL
//! results keyed by `custom_id = page id`, and rewrites each page's summary
//! on disk.  The queue is persisted to `summarization-queue.jsonl` so a
//! restart loses nothing; the worker persists it again on shutdown.

use std::path::PathBuf;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gro_model::{cancel::CancelSignal, fetch};

use crate::store::PageStore;
use crate::summarize::{SUMMARIZE_PROMPT, SUMMARY_UNAVAILABLE};

pub const QUEUE_FILE: &str = "summarization-queue.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryJob {
    pub page_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    pub label: String,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Jobs submitted per batch request.
    pub batch_size: usize,
    /// Poll cadence for outstanding batches.
    pub poll_interval: Duration,
    /// Attempts before a job is abandoned with "[Summary unavailable]".
    pub max_job_attempts: u32,
    /// Where the persistent queue lives.
    pub queue_path: PathBuf,
}

impl BatchConfig {
    pub fn new(queue_path: PathBuf, model: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.anthropic.com".into(),
            api_key: None,
            model: model.into(),
            batch_size: 50,
            poll_interval: Duration::from_secs(60),
            max_job_attempts: 3,
            queue_path,
        }
    }
}

/// Spawn the worker; returns the job sender and the task handle.
///
/// The worker holds only a weak handle to the store: if the session (and its
/// store) is gone when a result lands, the result is logged and dropped.
pub fn spawn(
    cfg: BatchConfig,
    store: Weak<Mutex<PageStore>>,
    cancel: CancelSignal,
) -> (mpsc::Sender<SummaryJob>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let handle = tokio::spawn(worker_loop(cfg, store, rx, cancel));
    (tx, handle)
}

async fn worker_loop(
    cfg: BatchConfig,
    store: Weak<Mutex<PageStore>>,
    mut rx: mpsc::Receiver<SummaryJob>,
    cancel: CancelSignal,
) {
    let client = reqwest::Client::new();
    let mut queue = load_queue(&cfg.queue_path);
    // batch id → jobs included in it
    let mut outstanding: Vec<(String, Vec<SummaryJob>)> = Vec::new();

    loop {
        while let Ok(job) = rx.try_recv() {
            queue.push(job);
        }
        if cancel.is_cancelled() {
            break;
        }

        if !queue.is_empty() {
            let take = queue.len().min(cfg.batch_size);
            let jobs: Vec<SummaryJob> = queue.drain(..take).collect();
            match submit_batch(&client, &cfg, &store, &jobs, &cancel).await {
                Ok(Some(batch_id)) => {
                    debug!(batch_id = %batch_id, jobs = jobs.len(), "batch submitted");
                    outstanding.push((batch_id, jobs));
                }
                Ok(None) => {} // nothing submittable (pages gone)
                Err(e) => {
                    warn!(error = %e, "batch submit failed; re-queueing");
                    queue.extend(jobs);
                }
            }
        }
        persist_queue(&cfg.queue_path, &queue);

        let mut still_open = Vec::new();
        for (batch_id, jobs) in outstanding.drain(..) {
            match poll_batch(&client, &cfg, &batch_id, &cancel).await {
                Ok(Some(results_url)) => {
                    ingest_results(&client, &cfg, &store, &results_url, jobs, &mut queue, &cancel)
                        .await;
                }
                Ok(None) => still_open.push((batch_id, jobs)),
                Err(e) => {
                    warn!(batch_id = %batch_id, error = %e, "batch poll failed");
                    still_open.push((batch_id, jobs));
                }
            }
        }
        outstanding = still_open;
        persist_queue(&cfg.queue_path, &queue);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = rx.recv() => {
                match job {
                    Some(j) => queue.push(j),
                    None => break, // all senders dropped: session over
                }
            }
            _ = tokio::time::sleep(cfg.poll_interval) => {}
        }
    }

    // Shutdown: cancellation stops polling but the upstream batches remain
    // chargeable; only the local queue is persisted.
    persist_queue(&cfg.queue_path, &queue);
}

/// Submit one batch.  Returns the batch id, or `None` when no referenced
/// page still exists.
async fn submit_batch(
    client: &reqwest::Client,
    cfg: &BatchConfig,
    store: &Weak<Mutex<PageStore>>,
    jobs: &[SummaryJob],
    cancel: &CancelSignal,
) -> anyhow::Result<Option<String>> {
    let Some(store) = store.upgrade() else {
        warn!("page store dropped; batch jobs discarded");
        return Ok(None);
    };
    let mut requests = Vec::new();
    {
        let mut store = store.lock().expect("store lock");
        for job in jobs {
            let Some(page) = store.read(&job.page_id)? else {
                warn!(page_id = %job.page_id, "page not found; dropping job");
                continue;
            };
            requests.push(json!({
                "custom_id": job.page_id,
                "params": {
                    "model": cfg.model,
                    "max_tokens": 512,
                    "messages": [{
                        "role": "user",
                        "content": format!("{SUMMARIZE_PROMPT}\n\n---\n\n{}", page.content),
                    }],
                }
            }));
        }
    }
    if requests.is_empty() {
        return Ok(None);
    }

    let key = resolve_key(cfg)?;
    let resp = fetch::post_json(
        client,
        &format!("{}/v1/messages/batches", cfg.base_url.trim_end_matches('/')),
        &batch_headers(&key),
        &json!({ "requests": requests }),
        fetch::SHORT_REQUEST_TIMEOUT,
        "batch.submit",
        cancel,
    )
    .await?;
    let v: Value = resp.json().await?;
    v["id"]
        .as_str()
        .map(|s| Some(s.to_string()))
        .ok_or_else(|| anyhow::anyhow!("batch response missing id: {v}"))
}

/// Poll one batch.  `Ok(Some(results_url))` once processing has ended.
async fn poll_batch(
    client: &reqwest::Client,
    cfg: &BatchConfig,
    batch_id: &str,
    cancel: &CancelSignal,
) -> anyhow::Result<Option<String>> {
    let key = resolve_key(cfg)?;
    let resp = fetch::get(
        client,
        &format!(
            "{}/v1/messages/batches/{batch_id}",
            cfg.base_url.trim_end_matches('/')
        ),
        &batch_headers(&key),
        fetch::SHORT_REQUEST_TIMEOUT,
        "batch.poll",
        cancel,
    )
    .await?;
    let v: Value = resp.json().await?;
    if v["processing_status"].as_str() == Some("ended") {
        Ok(v["results_url"].as_str().map(str::to_string))
    } else {
        Ok(None)
    }
}

async fn ingest_results(
    client: &reqwest::Client,
    cfg: &BatchConfig,
    store: &Weak<Mutex<PageStore>>,
    results_url: &str,
    jobs: Vec<SummaryJob>,
    queue: &mut Vec<SummaryJob>,
    cancel: &CancelSignal,
) {
    let body = match fetch::get(
        client,
        results_url,
        &batch_headers(&resolve_key(cfg).unwrap_or_default()),
        Duration::from_secs(30),
        "batch.results",
        cancel,
    )
    .await
    {
        Ok(resp) => resp.text().await.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "results download failed; re-queueing batch");
            queue.extend(jobs);
            return;
        }
    };

    let results = parse_batch_results(&body);
    let Some(store) = store.upgrade() else {
        warn!("page store dropped; batch results discarded");
        return;
    };
    let mut store = store.lock().expect("store lock");
    for job in jobs {
        let result = results.iter().find(|(id, _)| *id == job.page_id);
        if let Some((_, Ok(summary))) = result {
            if let Err(e) = store.update_summary(&job.page_id, summary.clone()) {
                warn!(page_id = %job.page_id, error = %e, "summary rewrite failed");
            }
            continue;
        }
        let reason = result
            .and_then(|(_, r)| r.as_ref().err())
            .map(String::as_str)
            .unwrap_or("missing result");
        if job.attempts + 1 >= cfg.max_job_attempts {
            warn!(page_id = %job.page_id, reason, "giving up on summary");
            let _ = store.update_summary(&job.page_id, SUMMARY_UNAVAILABLE);
        } else {
            // Placeholder stays in place; try again in a later batch.
            queue.push(SummaryJob {
                attempts: job.attempts + 1,
                ..job
            });
        }
    }
}

/// Parse a batch results JSONL body into `(custom_id, summary-or-error)`.
pub(crate) fn parse_batch_results(body: &str) -> Vec<(String, Result<String, String>)> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let v: Value = serde_json::from_str(line).ok()?;
            let id = v["custom_id"].as_str()?.to_string();
            let result = &v["result"];
            if result["type"].as_str() == Some("succeeded") {
                let text = result["message"]["content"]
                    .as_array()
                    .and_then(|blocks| {
                        blocks
                            .iter()
                            .find_map(|b| b["text"].as_str().map(str::to_string))
                    })
                    .unwrap_or_default();
                if text.is_empty() {
                    Some((id, Err("empty summary".to_string())))
                } else {
                    Some((id, Ok(text)))
                }
            } else {
                let reason = result["error"]["message"]
                    .as_str()
                    .unwrap_or("unspecified batch error")
                    .to_string();
                Some((id, Err(reason)))
            }
        })
        .collect()
}

fn batch_headers(key: &str) -> Vec<(String, String)> {
    vec![
        ("x-api-key".to_string(), key.to_string()),
        ("anthropic-version".to_string(), "2023-06-01".to_string()),
    ]
}

fn resolve_key(cfg: &BatchConfig) -> anyhow::Result<String> {
    cfg.api_key
        .clone()
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
        .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY not set for batch summarizer"))
}

// ─── Queue persistence ───────────────────────────────────────────────────────

pub(crate) fn load_queue(path: &PathBuf) -> Vec<SummaryJob> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    // A partially written last line is skipped, not fatal.
    text.lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

pub(crate) fn persist_queue(path: &PathBuf, queue: &[SummaryJob]) {
    let body: String = queue
        .iter()
        .filter_map(|j| serde_json::to_string(j).ok())
        .map(|l| l + "\n")
        .collect();
    let tmp = path.with_extension("jsonl.tmp");
    if std::fs::write(&tmp, body).and_then(|_| std::fs::rename(&tmp, path)).is_err() {
        warn!(path = %path.display(), "failed to persist summarization queue");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> SummaryJob {
        SummaryJob {
            page_id: id.into(),
            lane: Some("user".into()),
            label: format!("user@{id}"),
            attempts: 0,
        }
    }

    #[test]
    fn queue_round_trips_through_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUEUE_FILE);
        let jobs = vec![job("pg_aaa"), job("pg_bbb")];
        persist_queue(&path, &jobs);
        let loaded = load_queue(&path);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].page_id, "pg_aaa");
        assert_eq!(loaded[1].label, "user@pg_bbb");
    }

    #[test]
    fn partial_last_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUEUE_FILE);
        std::fs::write(
            &path,
            "{\"page_id\":\"pg_ok\",\"label\":\"l\"}\n{\"page_id\":\"pg_trunc",
        )
        .unwrap();
        let loaded = load_queue(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].page_id, "pg_ok");
    }

    #[test]
    fn missing_queue_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_queue(&dir.path().join("absent.jsonl")).is_empty());
    }

    #[test]
    fn results_jsonl_parsed_by_custom_id() {
        let body = concat!(
            "{\"custom_id\":\"pg_one\",\"result\":{\"type\":\"succeeded\",",
            "\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"summary one\"}]}}}\n",
            "{\"custom_id\":\"pg_two\",\"result\":{\"type\":\"errored\",",
            "\"error\":{\"message\":\"overloaded\"}}}\n",
        );
        let results = parse_batch_results(body);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "pg_one");
        assert_eq!(results[0].1.as_deref().unwrap(), "summary one");
        assert_eq!(results[1].1.as_deref().unwrap_err(), "overloaded");
    }

    #[test]
    fn blank_lines_in_results_are_ignored() {
        let body = "\n\n{\"custom_id\":\"pg_x\",\"result\":{\"type\":\"succeeded\",\"message\":{\"content\":[{\"text\":\"s\"}]}}}\n\n";
        assert_eq!(parse_batch_results(body).len(), 1);
    }

    #[tokio::test]
    async fn worker_persists_queue_and_exits_on_cancel() {
        use crate::page::Page;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(PageStore::open(dir.path().join("pages")).unwrap()));
        store
            .lock()
            .unwrap()
            .create(Page::new("user@t", "body", 1, None, None));

        let mut cfg = BatchConfig::new(dir.path().join(QUEUE_FILE), "claude-3-5-haiku-latest");
        // No key and an unreachable endpoint: submit fails and the job must
        // land back in the persisted queue on shutdown.
        cfg.api_key = Some("test-key".into());
        cfg.base_url = "http://192.0.2.1:1".into();
        cfg.poll_interval = Duration::from_millis(10);

        let (handle, signal) = gro_model::cancel_pair();
        let (tx, worker) = spawn(cfg.clone(), Arc::downgrade(&store), signal);
        let page_id = store.lock().unwrap().all().unwrap()[0].id.clone();
        tx.send(job(&page_id)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();
        worker.await.unwrap();

        let queue = load_queue(&cfg.queue_path);
        assert_eq!(queue.len(), 1, "failed job must be persisted for restart");
        assert_eq!(queue[0].page_id, page_id);
    }
}
