// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Inline runtime directives embedded in assistant output.
//!
//! The text is split into alternating prose and protected segments
//! (fenced code blocks and inline backtick spans).  `@@...@@` markers are
//! recognised only in prose; protected segments pass through verbatim.
//! Recognised markers are replaced with a glyph placeholder for display —
//! the glyph set is cosmetic, the stripping is the contract.
//!
//! Side effects are applied in a fixed order (learn → memory → thinking →
//! sampling → model) so a single assistant turn cannot race against itself.

use std::sync::OnceLock;

use regex::Regex;

// ─── Directive forms ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Learn(String),
    MemorySwap(String),
    ModelChange(String),
    ThinkingSet(f32),
    ThinkingUp,
    ThinkingDown,
    Temperature(f32),
    TopP(f32),
    TopK(u32),
    /// Explicit page loads.
    Ref(Vec<String>),
    /// `ref('?query')` semantic request.
    RefQuery(String),
    Unref(String),
    Importance(f32),
    MaxContext(usize),
    CompactContext,
    Sleep,
    Wake,
    Sense { channel: String, on: bool },
    View { channel: String, slot: Option<u32> },
    /// Observability only; recorded, never enforced.
    Emotion(Vec<(String, f32)>),
}

impl Directive {
    /// Application rank: lower applies first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Learn(_) => 0,
            Self::MemorySwap(_) => 1,
            Self::ThinkingSet(_) | Self::ThinkingUp | Self::ThinkingDown => 2,
            Self::Temperature(_) | Self::TopP(_) | Self::TopK(_) => 3,
            Self::ModelChange(_) => 4,
            _ => 5,
        }
    }

    fn glyph(&self) -> &'static str {
        match self {
            Self::Learn(_) => "✎",
            Self::MemorySwap(_) => "⌬",
            Self::ModelChange(_) => "⚙",
            Self::ThinkingSet(_) | Self::ThinkingUp => "✦",
            Self::ThinkingDown => "✧",
            Self::Temperature(_) | Self::TopP(_) | Self::TopK(_) => "≈",
            Self::Ref(_) | Self::RefQuery(_) => "⎘",
            Self::Unref(_) => "⌫",
            Self::Importance(_) => "★",
            Self::MaxContext(_) | Self::CompactContext => "⌛",
            Self::Sleep => "☾",
            Self::Wake => "☀",
            Self::Sense { .. } | Self::View { .. } => "◉",
            Self::Emotion(_) => "♡",
        }
    }
}

#[derive(Debug, Default)]
pub struct ParsedOutput {
    /// Display text: recognised markers replaced by glyphs, protected
    /// segments untouched.
    pub cleaned: String,
    /// Directives in document order.  Use [`apply_order`] before executing.
    pub directives: Vec<Directive>,
}

/// Stable sort into the fixed side-effect order.
pub fn apply_order(mut directives: Vec<Directive>) -> Vec<Directive> {
    directives.sort_by_key(Directive::rank);
    directives
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@@([^@\n]{1,200}?)@@").expect("marker regex"))
}

/// Parse assistant output text.  Idempotent: applying it to already-cleaned
/// text is a no-op.
pub fn parse(text: &str) -> ParsedOutput {
    let mut cleaned = String::with_capacity(text.len());
    let mut directives = Vec::new();

    for segment in segment_fences(text) {
        match segment {
            Segment::Protected(s) => cleaned.push_str(s),
            Segment::Prose(s) => {
                for inline in segment_inline_code(s) {
                    match inline {
                        Segment::Protected(code) => cleaned.push_str(code),
                        Segment::Prose(prose) => {
                            cleaned.push_str(&scan_prose(prose, &mut directives));
                        }
                    }
                }
            }
        }
    }

    ParsedOutput {
        cleaned,
        directives,
    }
}

enum Segment<'a> {
    Prose(&'a str),
    Protected(&'a str),
}

/// Split on fenced code blocks (``` or ~~~).  An unclosed fence protects the
/// rest of the text.
fn segment_fences(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut prose_start = 0usize;
    let mut fence: Option<(char, usize, usize)> = None; // (char, len, block start)
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let fence_here = ['`', '~'].iter().find_map(|&c| {
            let len = trimmed.chars().take_while(|&x| x == c).count();
            (len >= 3).then_some((c, len))
        });
        match (fence, fence_here) {
            (None, Some((c, len))) => {
                if prose_start < offset {
                    segments.push(Segment::Prose(&text[prose_start..offset]));
                }
                fence = Some((c, len, offset));
            }
            (Some((open_c, open_len, start)), Some((c, len)))
                if c == open_c && len >= open_len =>
            {
                segments.push(Segment::Protected(&text[start..offset + line.len()]));
                fence = None;
                prose_start = offset + line.len();
            }
            _ => {}
        }
        offset += line.len();
    }

    match fence {
        Some((_, _, start)) => segments.push(Segment::Protected(&text[start..])),
        None => {
            if prose_start < text.len() {
                segments.push(Segment::Prose(&text[prose_start..]));
            }
        }
    }
    segments
}

/// Split a prose segment on inline backtick spans.  An unmatched backtick
/// leaves the rest as prose.
fn segment_inline_code(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = text;
    let mut base = 0usize;
    loop {
        let Some(open) = rest.find('`') else {
            if !rest.is_empty() {
                segments.push(Segment::Prose(&text[base..]));
            }
            break;
        };
        let Some(close_rel) = rest[open + 1..].find('`') else {
            segments.push(Segment::Prose(&text[base..]));
            break;
        };
        let close = open + 1 + close_rel;
        if open > 0 {
            segments.push(Segment::Prose(&text[base..base + open]));
        }
        segments.push(Segment::Protected(&text[base + open..base + close + 1]));
        base += close + 1;
        rest = &text[base..];
    }
    segments
}

/// Find and execute markers in one prose run; returns the display text.
fn scan_prose(prose: &str, directives: &mut Vec<Directive>) -> String {
    marker_regex()
        .replace_all(prose, |caps: &regex::Captures<'_>| {
            match parse_marker(&caps[1]) {
                Some(parsed) => {
                    let glyph = parsed.glyph().to_string();
                    directives.push(parsed);
                    glyph
                }
                // Unknown markers stay verbatim; only recognised forms are
                // stripped.
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(s)
}

/// Parse the inside of one `@@...@@` marker.
fn parse_marker(inner: &str) -> Option<Directive> {
    let inner = inner.trim();

    // ctrl:key=value form
    if let Some(rest) = inner.strip_prefix("ctrl:") {
        let (key, value) = rest.split_once('=')?;
        return match key.trim() {
            "memory" => Some(Directive::MemorySwap(value.trim().to_string())),
            _ => None,
        };
    }

    // <emotion>:<val>[,…] form
    if emotion_regex().is_match(inner) {
        let pairs: Vec<(String, f32)> = inner
            .split(',')
            .filter_map(|pair| {
                let (name, value) = pair.split_once(':')?;
                Some((name.trim().to_string(), value.trim().parse().ok()?))
            })
            .collect();
        if !pairs.is_empty() {
            return Some(Directive::Emotion(pairs));
        }
    }

    // name or name(args)
    let (name, args) = match inner.find('(') {
        Some(open) => {
            let close = inner.rfind(')')?;
            (inner[..open].trim(), Some(inner[open + 1..close].trim()))
        }
        None => (inner, None),
    };

    match (name, args) {
        ("learn", Some(a)) => Some(Directive::Learn(unquote(a).to_string())),
        ("model" | "model-change", Some(a)) => {
            Some(Directive::ModelChange(unquote(a).to_string()))
        }
        ("thinking", Some(a)) => a.parse().ok().map(Directive::ThinkingSet),
        ("think" | "thinking-up", None) => Some(Directive::ThinkingUp),
        ("relax" | "thinking-down" | "zzz", None) => Some(Directive::ThinkingDown),
        ("temperature", Some(a)) => a.parse().ok().map(Directive::Temperature),
        ("top_p", Some(a)) => a.parse().ok().map(Directive::TopP),
        ("top_k", Some(a)) => a.parse().ok().map(Directive::TopK),
        ("ref", Some(a)) => {
            let arg = unquote(a);
            if let Some(query) = arg.strip_prefix('?') {
                Some(Directive::RefQuery(query.trim().to_string()))
            } else {
                let ids: Vec<String> = arg
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                (!ids.is_empty()).then_some(Directive::Ref(ids))
            }
        }
        ("unref", Some(a)) => Some(Directive::Unref(unquote(a).to_string())),
        ("importance", Some(a)) => unquote(a).parse().ok().map(Directive::Importance),
        ("max-context", Some(a)) => parse_context_size(unquote(a)).map(Directive::MaxContext),
        ("compact_context" | "compact-context", None) => Some(Directive::CompactContext),
        ("sleep" | "listening", None) => Some(Directive::Sleep),
        ("wake", None) => Some(Directive::Wake),
        ("sense", Some(a)) => {
            let mut parts = a.split(',').map(unquote);
            let channel = parts.next()?.to_string();
            let on = match parts.next()? {
                "on" => true,
                "off" => false,
                _ => return None,
            };
            Some(Directive::Sense { channel, on })
        }
        ("view", Some(a)) => {
            let mut parts = a.split(',').map(unquote);
            let channel = parts.next()?.to_string();
            let slot = parts.next().and_then(|s| s.parse().ok());
            Some(Directive::View { channel, slot })
        }
        _ => None,
    }
}

fn emotion_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z]+\s*:\s*-?[0-9.]+(\s*,\s*[a-z]+\s*:\s*-?[0-9.]+)*$")
            .expect("emotion regex")
    })
}

/// Parse "200k" / "1m" / plain token counts.
pub fn parse_context_size(s: &str) -> Option<usize> {
    let s = s.trim().to_ascii_lowercase();
    if let Some(n) = s.strip_suffix('k') {
        return n.trim().parse::<f64>().ok().map(|v| (v * 1_000.0) as usize);
    }
    if let Some(n) = s.strip_suffix('m') {
        return n
            .trim()
            .parse::<f64>()
            .ok()
            .map(|v| (v * 1_000_000.0) as usize);
    }
    s.parse().ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Recognition ───────────────────────────────────────────────────────────

    #[test]
    fn learn_directive_parsed_and_stripped() {
        let out = parse("Noted. @@learn('prefer tabs')@@ Moving on.");
        assert_eq!(out.directives, vec![Directive::Learn("prefer tabs".into())]);
        assert!(!out.cleaned.contains("@@"));
        assert!(out.cleaned.contains("Noted."));
        assert!(out.cleaned.contains("Moving on."));
    }

    #[test]
    fn model_change_both_spellings() {
        let a = parse("@@model-change('opus')@@");
        let b = parse("@@model('opus')@@");
        assert_eq!(a.directives, vec![Directive::ModelChange("opus".into())]);
        assert_eq!(b.directives, a.directives);
    }

    #[test]
    fn thinking_forms() {
        assert_eq!(
            parse("@@thinking(0.8)@@").directives,
            vec![Directive::ThinkingSet(0.8)]
        );
        assert_eq!(parse("@@think@@").directives, vec![Directive::ThinkingUp]);
        assert_eq!(
            parse("@@thinking-up@@").directives,
            vec![Directive::ThinkingUp]
        );
        for marker in ["@@relax@@", "@@thinking-down@@", "@@zzz@@"] {
            assert_eq!(parse(marker).directives, vec![Directive::ThinkingDown]);
        }
    }

    #[test]
    fn sampling_overrides() {
        let out = parse("@@temperature(0.9)@@ @@top_p(0.95)@@ @@top_k(40)@@");
        assert_eq!(
            out.directives,
            vec![
                Directive::Temperature(0.9),
                Directive::TopP(0.95),
                Directive::TopK(40),
            ]
        );
    }

    #[test]
    fn ref_single_multiple_and_query() {
        assert_eq!(
            parse("@@ref('pg_abc123def456')@@").directives,
            vec![Directive::Ref(vec!["pg_abc123def456".into()])]
        );
        assert_eq!(
            parse("@@ref('pg_a,pg_b')@@").directives,
            vec![Directive::Ref(vec!["pg_a".into(), "pg_b".into()])]
        );
        assert_eq!(
            parse("@@ref('?database migration')@@").directives,
            vec![Directive::RefQuery("database migration".into())]
        );
    }

    #[test]
    fn unref_and_importance() {
        let out = parse("@@unref('pg_a')@@ @@importance('0.9')@@");
        assert_eq!(
            out.directives,
            vec![
                Directive::Unref("pg_a".into()),
                Directive::Importance(0.9),
            ]
        );
    }

    #[test]
    fn context_controls() {
        assert_eq!(
            parse("@@max-context('200k')@@").directives,
            vec![Directive::MaxContext(200_000)]
        );
        assert_eq!(
            parse("@@compact_context@@").directives,
            vec![Directive::CompactContext]
        );
    }

    #[test]
    fn sleep_listening_wake() {
        assert_eq!(parse("@@sleep@@").directives, vec![Directive::Sleep]);
        assert_eq!(parse("@@listening@@").directives, vec![Directive::Sleep]);
        assert_eq!(parse("@@wake@@").directives, vec![Directive::Wake]);
    }

    #[test]
    fn sense_and_view() {
        assert_eq!(
            parse("@@sense('vision','on')@@").directives,
            vec![Directive::Sense {
                channel: "vision".into(),
                on: true
            }]
        );
        assert_eq!(
            parse("@@view('camera',2)@@").directives,
            vec![Directive::View {
                channel: "camera".into(),
                slot: Some(2)
            }]
        );
    }

    #[test]
    fn emotion_signal_recorded() {
        let out = parse("@@joy:0.8,fear:0.2@@");
        assert_eq!(
            out.directives,
            vec![Directive::Emotion(vec![
                ("joy".into(), 0.8),
                ("fear".into(), 0.2)
            ])]
        );
    }

    #[test]
    fn memory_swap_ctrl_form() {
        assert_eq!(
            parse("@@ctrl:memory=fragmentation@@").directives,
            vec![Directive::MemorySwap("fragmentation".into())]
        );
    }

    // ── Protection ────────────────────────────────────────────────────────────

    #[test]
    fn fenced_block_is_inert_and_verbatim() {
        let text = "Look:\n```\n@@learn('do not do this')@@\n```\nDone.";
        let out = parse(text);
        assert!(out.directives.is_empty(), "fenced markers must not execute");
        assert!(
            out.cleaned.contains("@@learn('do not do this')@@"),
            "fenced markers stay verbatim: {}",
            out.cleaned
        );
    }

    #[test]
    fn tilde_fence_also_protects() {
        let text = "~~~\n@@sleep@@\n~~~";
        let out = parse(text);
        assert!(out.directives.is_empty());
        assert!(out.cleaned.contains("@@sleep@@"));
    }

    #[test]
    fn inline_backtick_span_protects() {
        let out = parse("use `@@wake@@` to resume");
        assert!(out.directives.is_empty());
        assert_eq!(out.cleaned, "use `@@wake@@` to resume");
    }

    #[test]
    fn marker_outside_fence_still_fires() {
        let text = "```\n@@sleep@@\n```\n@@wake@@";
        let out = parse(text);
        assert_eq!(out.directives, vec![Directive::Wake]);
        assert!(out.cleaned.contains("@@sleep@@"));
        assert!(!out.cleaned.contains("@@wake@@"));
    }

    #[test]
    fn unclosed_fence_protects_the_tail() {
        let out = parse("before\n```\n@@sleep@@\nno closing fence");
        assert!(out.directives.is_empty());
        assert!(out.cleaned.contains("@@sleep@@"));
    }

    #[test]
    fn unknown_marker_left_verbatim() {
        let out = parse("@@frobnicate('x')@@");
        assert!(out.directives.is_empty());
        assert_eq!(out.cleaned, "@@frobnicate('x')@@");
    }

    // ── Idempotence & ordering ────────────────────────────────────────────────

    #[test]
    fn reparse_of_cleaned_text_is_a_noop() {
        let text = "a @@think@@ b\n```\n@@sleep@@\n```\n`@@wake@@` c @@learn('x')@@";
        let once = parse(text);
        let twice = parse(&once.cleaned);
        assert!(twice.directives.is_empty());
        assert_eq!(twice.cleaned, once.cleaned);
    }

    #[test]
    fn apply_order_sorts_by_side_effect_class() {
        let out = parse(
            "@@model('opus')@@ @@temperature(0.5)@@ @@think@@ \
             @@ctrl:memory=fragmentation@@ @@learn('f')@@",
        );
        let ordered = apply_order(out.directives);
        assert_eq!(ordered[0], Directive::Learn("f".into()));
        assert_eq!(ordered[1], Directive::MemorySwap("fragmentation".into()));
        assert_eq!(ordered[2], Directive::ThinkingUp);
        assert_eq!(ordered[3], Directive::Temperature(0.5));
        assert_eq!(ordered[4], Directive::ModelChange("opus".into()));
    }

    #[test]
    fn document_order_preserved_within_a_class() {
        let out = parse("@@learn('first')@@ then @@learn('second')@@");
        let ordered = apply_order(out.directives);
        assert_eq!(
            ordered,
            vec![
                Directive::Learn("first".into()),
                Directive::Learn("second".into())
            ]
        );
    }

    #[test]
    fn context_size_parsing() {
        assert_eq!(parse_context_size("200k"), Some(200_000));
        assert_eq!(parse_context_size("1.5m"), Some(1_500_000));
        assert_eq!(parse_context_size("4096"), Some(4096));
        assert_eq!(parse_context_size("lots"), None);
    }
}
