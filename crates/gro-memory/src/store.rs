// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Directory-backed page store, file-per-page.
//!
//! Writes are write-then-rename so a crash can never leave a torn page on
//! disk.  Reads are lazy: opening the store only scans for ids; bodies load
//! on first access.  A failed disk write keeps the page in memory and is
//! retried on the next compaction.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::warn;

use crate::page::Page;

pub struct PageStore {
    dir: PathBuf,
    /// Ids known to exist (on disk or in memory).
    ids: HashSet<String>,
    /// Loaded pages.
    cache: HashMap<String, Page>,
    /// Pages whose last disk write failed; retried by `flush_dirty`.
    dirty: HashSet<String>,
}

impl PageStore {
    /// Open (and create) the pages directory, scanning for existing ids.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating pages dir {}", dir.display()))?;
        let mut ids = HashSet::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(".json") {
                    if id.starts_with("pg_") {
                        ids.insert(id.to_string());
                    }
                }
            }
        }
        Ok(Self {
            dir,
            ids,
            cache: HashMap::new(),
            dirty: HashSet::new(),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn write_page(&self, page: &Page) -> anyhow::Result<()> {
        let path = self.path_for(&page.id);
        let tmp = self.dir.join(format!(".{}.tmp", page.id));
        let json = serde_json::to_string_pretty(page)?;
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    /// Insert a page.  A duplicate id is a silent no-op (content-addressed
    /// ids make re-creating an identical compaction harmless).  Disk failure
    /// keeps the page in memory and marks it for retry.
    pub fn create(&mut self, page: Page) -> String {
        let id = page.id.clone();
        if self.ids.contains(&id) {
            return id;
        }
        if let Err(e) = self.write_page(&page) {
            warn!(id = %id, error = %e, "page write failed; keeping in memory");
            self.dirty.insert(id.clone());
        }
        self.ids.insert(id.clone());
        self.cache.insert(id.clone(), page);
        id
    }

    /// Read a page by id, loading it from disk on first access.
    pub fn read(&mut self, id: &str) -> anyhow::Result<Option<Page>> {
        if let Some(p) = self.cache.get(id) {
            return Ok(Some(p.clone()));
        }
        if !self.ids.contains(id) {
            return Ok(None);
        }
        let path = self.path_for(id);
        let text =
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let page: Page =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        self.cache.insert(id.to_string(), page.clone());
        Ok(Some(page))
    }

    /// Rewrite only the summary field of an existing page.
    pub fn update_summary(&mut self, id: &str, summary: impl Into<String>) -> anyhow::Result<()> {
        let mut page = self
            .read(id)?
            .with_context(|| format!("page {id} not found"))?;
        page.summary = Some(summary.into());
        self.write_page(&page)?;
        self.cache.insert(id.to_string(), page);
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Load every page (exact search needs all bodies).
    pub fn all(&mut self) -> anyhow::Result<Vec<Page>> {
        let ids: Vec<String> = self.ids.iter().cloned().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = self.read(&id)? {
                out.push(p);
            }
        }
        Ok(out)
    }

    pub fn delete(&mut self, id: &str) -> anyhow::Result<()> {
        let path = self.path_for(id);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("deleting {}", path.display()))?;
        }
        self.ids.remove(id);
        self.cache.remove(id);
        self.dirty.remove(id);
        Ok(())
    }

    /// Retry writes that failed earlier.  Called at each compaction.
    pub fn flush_dirty(&mut self) {
        let pending: Vec<String> = self.dirty.iter().cloned().collect();
        for id in pending {
            let page = match self.cache.get(&id) {
                Some(p) => p.clone(),
                None => {
                    self.dirty.remove(&id);
                    continue;
                }
            };
            match self.write_page(&page) {
                Ok(()) => {
                    self.dirty.remove(&id);
                }
                Err(e) => warn!(id = %id, error = %e, "page write retry failed"),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn page(body: &str) -> Page {
        Page::new("user@t0", body, 2, Some("user".into()), None)
    }

    #[test]
    fn create_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path()).unwrap();
        let original = page("hello world");
        let id = store.create(original.clone());
        let loaded = store.read(&id).unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn written_page_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = PageStore::open(dir.path()).unwrap();
            store.create(page("persistent body"))
        };
        let mut store = PageStore::open(dir.path()).unwrap();
        assert!(store.contains(&id));
        let loaded = store.read(&id).unwrap().unwrap();
        assert_eq!(loaded.content, "persistent body");
        assert_eq!(loaded.message_count, 2);
        assert_eq!(loaded.lane.as_deref(), Some("user"));
    }

    #[test]
    fn duplicate_create_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path()).unwrap();
        let a = store.create(page("same"));
        let b = store.create(page("same"));
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_summary_rewrites_only_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path()).unwrap();
        let id = store.create(page("body stays"));
        store.update_summary(&id, "fresh summary").unwrap();

        let mut reopened = PageStore::open(dir.path()).unwrap();
        let loaded = reopened.read(&id).unwrap().unwrap();
        assert_eq!(loaded.summary.as_deref(), Some("fresh summary"));
        assert_eq!(loaded.content, "body stays");
        assert_eq!(loaded.id, id, "id must not change on summary rewrite");
    }

    #[test]
    fn update_summary_on_missing_page_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path()).unwrap();
        assert!(store.update_summary("pg_nope", "x").is_err());
    }

    #[test]
    fn read_missing_page_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path()).unwrap();
        assert!(store.read("pg_missing").unwrap().is_none());
    }

    #[test]
    fn delete_removes_file_and_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path()).unwrap();
        let id = store.create(page("temporary"));
        store.delete(&id).unwrap();
        assert!(!store.contains(&id));
        assert!(store.read(&id).unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path()).unwrap();
        store.create(page("a"));
        store.create(page("b"));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn all_loads_every_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PageStore::open(dir.path()).unwrap();
        store.create(page("one"));
        store.create(page("two"));
        assert_eq!(store.all().unwrap().len(), 2);
    }
}
