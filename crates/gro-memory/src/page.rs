// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Derive the deterministic page id from the page body.
///
/// `pg_` + first 12 hex characters of SHA-256 over the content.  Two
/// structurally identical compactions therefore dedupe to the same id, even
/// when they happen concurrently.
pub fn page_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("pg_{}", &hex::encode(digest)[..12])
}

/// An immutable, content-addressed record standing in for a compacted group
/// of messages.
///
/// The body is the authoritative record of what was compacted; the summary
/// is a display/injection representation and the only field ever rewritten
/// (by the batch summarizer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub label: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_importance: Option<f32>,
}

impl Page {
    pub fn new(
        label: impl Into<String>,
        content: impl Into<String>,
        message_count: usize,
        lane: Option<String>,
        max_importance: Option<f32>,
    ) -> Self {
        let content = content.into();
        Self {
            id: page_id(&content),
            label: label.into(),
            tokens: (content.len() / 4).max(1),
            content,
            created_at: Utc::now(),
            message_count,
            lane,
            summary: None,
            max_importance,
        }
    }

    /// The text injected into the system prompt when this page is loaded.
    pub fn display_summary(&self) -> &str {
        self.summary.as_deref().unwrap_or(&self.content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_hash_prefix_with_pg_prefix() {
        let p = Page::new("user@t0", "some compacted text", 3, None, None);
        assert!(p.id.starts_with("pg_"));
        assert_eq!(p.id.len(), 3 + 12);
        // ∀ page P: hash(P.content)[0..12] == P.id.stripPrefix("pg_")
        let digest = Sha256::digest(p.content.as_bytes());
        assert_eq!(p.id.strip_prefix("pg_").unwrap(), &hex::encode(digest)[..12]);
    }

    #[test]
    fn identical_content_gives_identical_id() {
        let a = Page::new("user@t0", "same body", 1, None, None);
        let b = Page::new("user@t9", "same body", 9, Some("user".into()), None);
        assert_eq!(a.id, b.id, "ids are content-addressed, not metadata-addressed");
    }

    #[test]
    fn different_content_gives_different_id() {
        let a = Page::new("l", "body one", 1, None, None);
        let b = Page::new("l", "body two", 1, None, None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn serde_round_trip_preserves_all_fields() {
        let mut p = Page::new("tool@t3", "dump", 4, Some("tool".into()), Some(0.8));
        p.summary = Some("a summary".into());
        let json = serde_json::to_string(&p).unwrap();
        let back: Page = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn display_summary_falls_back_to_content() {
        let mut p = Page::new("l", "the body", 1, None, None);
        assert_eq!(p.display_summary(), "the body");
        p.summary = Some("short".into());
        assert_eq!(p.display_summary(), "short");
    }

    #[test]
    fn token_estimate_uses_chars_over_four() {
        let p = Page::new("l", "x".repeat(400), 1, None, None);
        assert_eq!(p.tokens, 100);
    }
}
