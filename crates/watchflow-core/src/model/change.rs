//! Detected changes and content snapshots

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How page content is captured for comparison
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// Structural tree of the document body
    Dom,
    /// Visible body text
    #[default]
    Text,
    /// Full-page screenshot
    Visual,
    /// Hash of the raw HTML with volatile substrings erased
    Hash,
}

impl CaptureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::Dom => "dom",
            CaptureMethod::Text => "text",
            CaptureMethod::Visual => "visual",
            CaptureMethod::Hash => "hash",
        }
    }
}

impl FromStr for CaptureMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dom" => Ok(CaptureMethod::Dom),
            "text" => Ok(CaptureMethod::Text),
            "visual" => Ok(CaptureMethod::Visual),
            "hash" => Ok(CaptureMethod::Hash),
            other => Err(format!("unknown capture method: {other}")),
        }
    }
}

/// What kind of difference was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Content,
    Structure,
    Visual,
    Status,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Content => "content",
            ChangeKind::Structure => "structure",
            ChangeKind::Visual => "visual",
            ChangeKind::Status => "status",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(ChangeKind::Content),
            "structure" => Ok(ChangeKind::Structure),
            "visual" => Ok(ChangeKind::Visual),
            "status" => Ok(ChangeKind::Status),
            other => Err(format!("unknown change kind: {other}")),
        }
    }
}

/// Severity bucketed from the change score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ChangeSeverity {
    /// Bucket a change score (100 - similarity) into a severity
    pub fn from_score(score: f64) -> Self {
        if score < 10.0 {
            ChangeSeverity::Low
        } else if score < 30.0 {
            ChangeSeverity::Medium
        } else if score < 60.0 {
            ChangeSeverity::High
        } else {
            ChangeSeverity::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSeverity::Low => "low",
            ChangeSeverity::Medium => "medium",
            ChangeSeverity::High => "high",
            ChangeSeverity::Critical => "critical",
        }
    }
}

impl FromStr for ChangeSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ChangeSeverity::Low),
            "medium" => Ok(ChangeSeverity::Medium),
            "high" => Ok(ChangeSeverity::High),
            "critical" => Ok(ChangeSeverity::Critical),
            other => Err(format!("unknown change severity: {other}")),
        }
    }
}

/// A detected difference for a monitored URL
///
/// Immutable after creation except for the `acknowledged` and `notified`
/// flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub run_id: Option<Uuid>,
    pub url: String,
    pub kind: ChangeKind,
    pub severity: ChangeSeverity,
    /// Similarity to the previous snapshot, 0..=100
    pub similarity: f64,
    /// Always `100 - similarity`
    pub change_score: f64,
    pub previous_value: Option<String>,
    pub current_value: Option<String>,
    /// Method-specific diff details (added/removed/modified)
    pub diff: serde_json::Value,
    /// Base64-encoded screenshot, when the method produced one
    pub screenshot: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub notified: bool,
}

impl Change {
    pub fn new(workflow_id: Uuid, url: impl Into<String>, kind: ChangeKind, similarity: f64) -> Self {
        let similarity = similarity.clamp(0.0, 100.0);
        let change_score = 100.0 - similarity;
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            run_id: None,
            url: url.into(),
            kind,
            severity: ChangeSeverity::from_score(change_score),
            similarity,
            change_score,
            previous_value: None,
            current_value: None,
            diff: serde_json::Value::Null,
            screenshot: None,
            detected_at: Utc::now(),
            acknowledged: false,
            notified: false,
        }
    }
}

/// Page metadata captured alongside every snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    /// First ten non-data-URL image sources
    pub images: Vec<String>,
}

/// The detector's memoized reference state per (workflow, URL)
///
/// Replaced atomically on each detected change; never partially updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSnapshot {
    pub workflow_id: Uuid,
    pub url: String,
    pub method: CaptureMethod,
    /// Method-shaped content: DOM tree, text, base64 image, or hash input
    pub content: serde_json::Value,
    /// SHA-256 over the canonicalized content
    pub content_hash: String,
    pub metadata: PageMetadata,
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_buckets() {
        assert_eq!(ChangeSeverity::from_score(0.0), ChangeSeverity::Low);
        assert_eq!(ChangeSeverity::from_score(9.9), ChangeSeverity::Low);
        assert_eq!(ChangeSeverity::from_score(10.0), ChangeSeverity::Medium);
        assert_eq!(ChangeSeverity::from_score(29.9), ChangeSeverity::Medium);
        assert_eq!(ChangeSeverity::from_score(30.0), ChangeSeverity::High);
        assert_eq!(ChangeSeverity::from_score(59.9), ChangeSeverity::High);
        assert_eq!(ChangeSeverity::from_score(60.0), ChangeSeverity::Critical);
        assert_eq!(ChangeSeverity::from_score(100.0), ChangeSeverity::Critical);
    }

    #[test]
    fn test_change_score_complement() {
        let workflow_id = Uuid::now_v7();
        let change = Change::new(workflow_id, "https://example.test", ChangeKind::Content, 72.5);
        assert!((change.change_score - 27.5).abs() < f64::EPSILON);
        assert_eq!(change.severity, ChangeSeverity::Medium);
    }
}
