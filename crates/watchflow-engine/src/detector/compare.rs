//! Text, visual, and hash comparison

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};

/// Edit-distance similarity between two texts, 0..=100
///
/// `sim(a, a) = 100` and `sim(a, b) = sim(b, a)`.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 100.0;
    }
    let longer = a.chars().count().max(b.chars().count());
    if longer == 0 {
        return 100.0;
    }
    let distance = strsim::levenshtein(a, b);
    ((longer - distance.min(longer)) as f64 / longer as f64) * 100.0
}

/// Result of comparing two text captures
#[derive(Debug, Clone)]
pub struct TextComparison {
    pub similarity: f64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl TextComparison {
    pub fn diff_value(&self) -> Value {
        json!({
            "added": self.added,
            "removed": self.removed,
        })
    }
}

/// Line-level diff plus edit-distance similarity
pub fn compare_text(previous: &str, current: &str) -> TextComparison {
    let diff = TextDiff::from_lines(previous, current);
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for change in diff.iter_all_changes() {
        let line = change.value().trim_end_matches('\n');
        match change.tag() {
            ChangeTag::Insert => added.push(line.to_string()),
            ChangeTag::Delete => removed.push(line.to_string()),
            ChangeTag::Equal => {}
        }
    }
    TextComparison {
        similarity: text_similarity(previous, current),
        added,
        removed,
    }
}

/// SHA-256 hex digest
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn iso_timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?",
        )
        .expect("valid regex")
    })
}

fn epoch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // 10-13 digits covers unix seconds and milliseconds
    RE.get_or_init(|| Regex::new(r"\b\d{10,13}\b").expect("valid regex"))
}

/// Erase volatile substrings prior to hashing: ISO-8601 timestamps,
/// epoch integers, and configured patterns
pub fn erase_volatile(content: &str, extra_patterns: &[Regex]) -> String {
    let mut out = iso_timestamp_re().replace_all(content, "").into_owned();
    out = epoch_re().replace_all(&out, "").into_owned();
    for pattern in extra_patterns {
        out = pattern.replace_all(&out, "").into_owned();
    }
    out
}

/// Elide ignore-pattern matches from visible text
pub fn elide_patterns(text: &str, patterns: &[Regex]) -> String {
    let mut out = text.to_string();
    for pattern in patterns {
        out = pattern.replace_all(&out, "").into_owned();
    }
    out
}
