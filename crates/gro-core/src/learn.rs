// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Learned-facts file (`_learn.md`).
//!
//! Facts are appended one per line; appends are atomic at line granularity
//! (O_APPEND), and readers tolerate a torn last line by skipping anything
//! not terminated with a newline.

use std::io::Write;
use std::path::Path;

use anyhow::Context;

pub fn append_fact(path: &Path, fact: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "- {}", fact.replace('\n', " "))
        .with_context(|| format!("appending to {}", path.display()))?;
    Ok(())
}

pub fn load_facts(path: &Path) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let complete = match text.rfind('\n') {
        Some(pos) => &text[..=pos],
        None => "", // single torn line
    };
    complete
        .lines()
        .filter_map(|l| l.strip_prefix("- "))
        .map(str::to_string)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_learn.md");
        append_fact(&path, "the deploy script lives in ops/").unwrap();
        append_fact(&path, "prefer rebase over merge").unwrap();
        let facts = load_facts(&path);
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0], "the deploy script lives in ops/");
    }

    #[test]
    fn newlines_in_facts_are_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_learn.md");
        append_fact(&path, "multi\nline").unwrap();
        assert_eq!(load_facts(&path), vec!["multi line"]);
    }

    #[test]
    fn torn_last_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_learn.md");
        std::fs::write(&path, "- complete fact\n- torn fac").unwrap();
        assert_eq!(load_facts(&path), vec!["complete fact"]);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_facts(&dir.path().join("absent.md")).is_empty());
    }
}
