//! Change detector
//!
//! Captures content snapshots per (workflow, URL) and computes
//! structural/textual/visual/hash diffs. The first capture for a pair
//! stores the baseline and reports no change; later captures compare to
//! the stored snapshot and replace it only when a change is detected, so
//! consecutive unchanged captures keep the original baseline.

pub mod compare;
pub mod dom;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use watchflow_core::browser::{Browser, Tab};
use watchflow_core::bus::{EngineEvent, EventBus};
use watchflow_core::model::{
    CaptureMethod, Change, ChangeDetectionConfig, ChangeKind, ChangeSeverity, ContentSnapshot,
    PageMetadata,
};
use watchflow_storage::Repository;

use crate::error::{EngineError, Result};
use compare::{compare_text, elide_patterns, erase_volatile, sha256_hex};
use dom::{compare_dom, filter_tree, tree_text, DomNode, SimpleSelector, DEFAULT_ATTRIBUTE_ALLOWLIST};

const NETWORK_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_IMAGE_LIMIT: usize = 10;

/// Outcome of one detect call
#[derive(Debug)]
pub struct ChangeResult {
    pub has_changed: bool,
    pub similarity: f64,
    /// True when this call stored the baseline
    pub first_capture: bool,
    pub change: Option<Change>,
}

struct Captured {
    content: Value,
    /// Canonical string the content hash is computed over
    canonical: String,
    metadata: PageMetadata,
    status: Option<u16>,
    screenshot_b64: Option<String>,
}

struct MethodComparison {
    similarity: f64,
    kind: ChangeKind,
    diff: Value,
    added_paths: Vec<String>,
    changed_text: Option<String>,
}

/// Detector over the browser facade and the snapshot store
///
/// Safe for many concurrent detect calls; per-(workflow, URL) captures are
/// serialized through keyed locks so the first-change-wins policy holds.
pub struct ChangeDetector {
    repo: Arc<dyn Repository>,
    browser: Arc<dyn Browser>,
    bus: EventBus,
    capture_locks: DashMap<(Uuid, String), Arc<tokio::sync::Mutex<()>>>,
}

impl ChangeDetector {
    pub fn new(repo: Arc<dyn Repository>, browser: Arc<dyn Browser>, bus: EventBus) -> Self {
        Self {
            repo,
            browser,
            bus,
            capture_locks: DashMap::new(),
        }
    }

    /// Capture the URL and compare against the stored baseline
    #[instrument(skip(self, config), fields(%workflow_id, url))]
    pub async fn detect(
        &self,
        workflow_id: Uuid,
        url: &str,
        config: &ChangeDetectionConfig,
    ) -> Result<ChangeResult> {
        let lock = self
            .capture_locks
            .entry((workflow_id, url.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let captured = self.capture(url, config).await?;
        let snapshot = ContentSnapshot {
            workflow_id,
            url: url.to_string(),
            method: config.method,
            content: captured.content.clone(),
            content_hash: sha256_hex(&captured.canonical),
            metadata: captured.metadata.clone(),
            captured_at: Utc::now(),
        };

        let Some(previous) = self.repo.get_snapshot(workflow_id, url).await? else {
            self.repo.put_snapshot(snapshot).await?;
            debug!("stored baseline snapshot");
            return Ok(ChangeResult {
                has_changed: false,
                similarity: 100.0,
                first_capture: true,
                change: None,
            });
        };

        let comparison = compare_snapshots(config.method, &previous, &captured);
        if comparison.similarity >= config.threshold {
            // Unchanged: the original baseline stays in place
            return Ok(ChangeResult {
                has_changed: false,
                similarity: comparison.similarity,
                first_capture: false,
                change: None,
            });
        }

        let mut change = Change::new(workflow_id, url, comparison.kind, comparison.similarity);
        change.previous_value = Some(snapshot_repr(config.method, &previous.content));
        change.current_value = Some(captured.canonical.clone());
        change.diff = comparison.diff.clone();
        if config.method == CaptureMethod::Visual {
            change.screenshot = captured.screenshot_b64.clone();
        }

        let change = self.repo.create_change(change).await?;
        self.repo.put_snapshot(snapshot).await?;
        self.bump_change_metrics(workflow_id).await;

        info!(
            change_id = %change.id,
            severity = change.severity.as_str(),
            similarity = comparison.similarity,
            "change detected"
        );
        self.bus.publish(EngineEvent::ChangeDetected {
            workflow_id,
            change_id: change.id,
            url: url.to_string(),
            kind: change.kind,
            severity: change.severity,
            change_score: change.change_score,
            added_paths: comparison.added_paths,
            changed_text: comparison.changed_text,
            status_code: captured.status,
        });

        Ok(ChangeResult {
            has_changed: true,
            similarity: comparison.similarity,
            first_capture: false,
            change: Some(change),
        })
    }

    /// Periodic loop driving detect for every monitored URL of a workflow
    pub async fn run_loop(
        self: Arc<Self>,
        workflow_id: Uuid,
        config: ChangeDetectionConfig,
        cancel: CancellationToken,
    ) {
        let period = Duration::from_millis(config.interval_ms.max(1_000));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for url in &config.urls {
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = self.detect(workflow_id, url, &config).await {
                    warn!(%workflow_id, url, error = %e, "detect failed");
                }
            }
        }
    }

    async fn bump_change_metrics(&self, workflow_id: Uuid) {
        match self.repo.get_workflow(workflow_id).await {
            Ok(mut workflow) => {
                workflow.metrics.record_change();
                if let Err(e) = self.repo.update_workflow(workflow).await {
                    warn!(%workflow_id, error = %e, "failed to update change metrics");
                }
            }
            Err(e) => warn!(%workflow_id, error = %e, "failed to load workflow for metrics"),
        }
    }

    async fn capture(&self, url: &str, config: &ChangeDetectionConfig) -> Result<Captured> {
        let mut tab = self.browser.open_tab().await?;
        let result = capture_with_tab(tab.as_mut(), url, config).await;
        // The tab is closed on every exit path
        let _ = tab.close().await;
        result
    }
}

async fn capture_with_tab(
    tab: &mut dyn Tab,
    url: &str,
    config: &ChangeDetectionConfig,
) -> Result<Captured> {
    let ignore = compile_selectors(&config.ignore_selectors);
    let patterns = compile_patterns(&config.ignore_patterns)?;
    let allowlist: BTreeSet<String> = config
        .attribute_allowlist
        .clone()
        .unwrap_or_else(|| {
            DEFAULT_ATTRIBUTE_ALLOWLIST
                .iter()
                .map(|s| s.to_string())
                .collect()
        })
        .into_iter()
        .collect();

    tab.navigate(url).await?;
    tab.wait_for_network_idle(NETWORK_IDLE_TIMEOUT).await?;

    let metadata = parse_metadata(tab.page_metadata().await.unwrap_or(Value::Null));
    let status = tab.last_status().await.unwrap_or(None);

    let (content, canonical, screenshot_b64) = match config.method {
        CaptureMethod::Dom => {
            let raw = tab.dom_snapshot().await?;
            let node = DomNode::from_value(&raw)
                .ok_or_else(|| EngineError::external("malformed dom snapshot"))?;
            let filtered = filter_tree(&node, &ignore, &allowlist)
                .unwrap_or_else(|| DomNode {
                    tag: "body".to_string(),
                    attributes: Default::default(),
                    text: None,
                    children: vec![],
                });
            let canonical = serde_json::to_string(&filtered)
                .map_err(|e| EngineError::external(e.to_string()))?;
            (serde_json::to_value(&filtered).unwrap_or(Value::Null), canonical, None)
        }
        CaptureMethod::Text => {
            let text = if ignore.is_empty() {
                tab.inner_text().await?
            } else {
                // Derive text from the filtered tree so ignored selectors drop out
                let raw = tab.dom_snapshot().await?;
                match DomNode::from_value(&raw) {
                    Some(node) => filter_tree(&node, &ignore, &allowlist)
                        .map(|t| tree_text(&t))
                        .unwrap_or_default(),
                    None => tab.inner_text().await?,
                }
            };
            let text = elide_patterns(&text, &patterns);
            (Value::String(text.clone()), text, None)
        }
        CaptureMethod::Visual => {
            let bytes = tab.screenshot().await?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            (Value::String(encoded.clone()), encoded.clone(), Some(encoded))
        }
        CaptureMethod::Hash => {
            let html = tab.content().await?;
            let erased = erase_volatile(&html, &patterns);
            let digest = sha256_hex(&erased);
            (Value::String(digest.clone()), digest, None)
        }
    };

    Ok(Captured {
        content,
        canonical,
        metadata,
        status,
        screenshot_b64,
    })
}

fn compile_selectors(selectors: &[String]) -> Vec<SimpleSelector> {
    selectors.iter().map(|s| SimpleSelector::parse(s)).collect()
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map_err(|e| EngineError::validation(format!("bad ignore pattern {p:?}: {e}")))
        })
        .collect()
}

fn parse_metadata(raw: Value) -> PageMetadata {
    let title = raw
        .get("title")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let description = raw
        .get("description")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let keywords = raw
        .get("keywords")
        .and_then(Value::as_str)
        .map(|s| {
            s.split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let images = raw
        .get("images")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|src| !src.starts_with("data:"))
                .take(METADATA_IMAGE_LIMIT)
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    PageMetadata {
        title,
        description,
        keywords,
        images,
    }
}

fn snapshot_repr(method: CaptureMethod, content: &Value) -> String {
    match method {
        CaptureMethod::Dom => content.to_string(),
        _ => content.as_str().map(|s| s.to_string()).unwrap_or_else(|| content.to_string()),
    }
}

fn compare_snapshots(
    method: CaptureMethod,
    previous: &ContentSnapshot,
    current: &Captured,
) -> MethodComparison {
    match method {
        CaptureMethod::Dom => {
            let prev_node = DomNode::from_value(&previous.content);
            let curr_node = DomNode::from_value(&current.content);
            match (prev_node, curr_node) {
                (Some(prev), Some(curr)) => {
                    let cmp = compare_dom(&prev, &curr);
                    let changed_text = dom_changed_text(&cmp, &curr);
                    MethodComparison {
                        similarity: cmp.similarity,
                        kind: ChangeKind::Structure,
                        diff: cmp.diff_value(),
                        added_paths: cmp.added.clone(),
                        changed_text,
                    }
                }
                // A baseline that no longer parses counts as a full change
                _ => MethodComparison {
                    similarity: 0.0,
                    kind: ChangeKind::Structure,
                    diff: json!({"note": "baseline snapshot unreadable"}),
                    added_paths: vec![],
                    changed_text: None,
                },
            }
        }
        CaptureMethod::Text => {
            let prev_text = previous.content.as_str().unwrap_or_default();
            let cmp = compare_text(prev_text, &current.canonical);
            let changed_text = if cmp.added.is_empty() && cmp.removed.is_empty() {
                None
            } else {
                Some(cmp.added.join("\n"))
            };
            MethodComparison {
                similarity: cmp.similarity,
                kind: ChangeKind::Content,
                diff: cmp.diff_value(),
                added_paths: vec![],
                changed_text,
            }
        }
        CaptureMethod::Visual => {
            let prev_bytes = previous.content.as_str().unwrap_or_default();
            let equal = prev_bytes == current.canonical;
            MethodComparison {
                similarity: if equal { 100.0 } else { 0.0 },
                kind: ChangeKind::Visual,
                diff: json!({"pixel_equal": equal}),
                added_paths: vec![],
                changed_text: None,
            }
        }
        CaptureMethod::Hash => {
            let equal = previous.content.as_str().unwrap_or_default() == current.canonical;
            MethodComparison {
                similarity: if equal { 100.0 } else { 0.0 },
                kind: ChangeKind::Content,
                diff: json!({
                    "previous_hash": previous.content,
                    "current_hash": current.canonical,
                }),
                added_paths: vec![],
                changed_text: None,
            }
        }
    }
}

fn dom_changed_text(cmp: &dom::DomComparison, current: &DomNode) -> Option<String> {
    let mut parts: Vec<String> = cmp
        .modified
        .iter()
        .filter(|m| m.field == "text")
        .filter_map(|m| m.after.as_str().map(|s| s.to_string()))
        .collect();
    if !cmp.added.is_empty() {
        // Added subtrees contribute their visible text
        let flat = dom::flatten(current);
        for path in &cmp.added {
            if let Some(node) = flat.get(path) {
                if let Some(text) = &node.text {
                    parts.push(text.clone());
                }
            }
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watchflow_core::browser::{PageFixture, StubBrowser};
    use watchflow_storage::InMemoryRepository;

    fn dom_fixture(h1: &str) -> PageFixture {
        PageFixture {
            dom: json!({
                "tag": "body",
                "attributes": {},
                "children": [
                    {"tag": "h1", "attributes": {}, "text": h1, "children": []}
                ]
            }),
            status: 200,
            ..Default::default()
        }
    }

    fn detector(browser: &StubBrowser) -> (Arc<ChangeDetector>, Arc<InMemoryRepository>, EventBus) {
        let bus = EventBus::default();
        let repo = Arc::new(InMemoryRepository::new(bus.clone()));
        let detector = Arc::new(ChangeDetector::new(
            repo.clone(),
            Arc::new(browser.clone()),
            bus.clone(),
        ));
        (detector, repo, bus)
    }

    fn dom_config() -> ChangeDetectionConfig {
        ChangeDetectionConfig {
            method: CaptureMethod::Dom,
            urls: vec!["https://page.test".to_string()],
            threshold: 99.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_capture_stores_baseline() {
        let browser = StubBrowser::new();
        browser.set_page("https://page.test", dom_fixture("Hi"));
        let (detector, _, _) = detector(&browser);
        let workflow_id = Uuid::now_v7();

        let result = detector
            .detect(workflow_id, "https://page.test", &dom_config())
            .await
            .expect("should detect");

        assert!(result.first_capture);
        assert!(!result.has_changed);
        assert!((result.similarity - 100.0).abs() < f64::EPSILON);
        assert_eq!(browser.open_tab_count(), 0);
    }

    #[tokio::test]
    async fn test_dom_change_detected_and_baseline_replaced() {
        let browser = StubBrowser::new();
        browser.set_page("https://page.test", dom_fixture("Hi"));
        let (detector, _, bus) = detector(&browser);
        let mut rx = bus.subscribe();
        let workflow_id = Uuid::now_v7();
        let config = dom_config();

        detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("baseline");

        browser.set_page("https://page.test", dom_fixture("Bye"));
        let result = detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("should detect");

        assert!(result.has_changed);
        let change = result.change.expect("change persisted");
        assert_eq!(change.kind, ChangeKind::Structure);
        let modified = change.diff["modified"]
            .as_array()
            .expect("modified array");
        assert!(modified
            .iter()
            .any(|m| m["path"] == "body/h1[0]" && m["field"] == "text"));

        // The event carries the change
        let mut saw_change = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type() == "change:detected" {
                saw_change = true;
            }
        }
        assert!(saw_change);

        // Third capture identical to the second: baseline was replaced
        let result = detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("should detect");
        assert!(!result.has_changed);
    }

    #[tokio::test]
    async fn test_unchanged_keeps_original_baseline() {
        let browser = StubBrowser::new();
        // Threshold 50: a small change does not replace the baseline
        let mut config = dom_config();
        config.threshold = 50.0;
        browser.set_page(
            "https://page.test",
            PageFixture {
                dom: json!({
                    "tag": "body", "attributes": {}, "children": [
                        {"tag": "h1", "attributes": {}, "text": "a", "children": []},
                        {"tag": "p", "attributes": {}, "text": "b", "children": []},
                        {"tag": "p", "attributes": {}, "text": "c", "children": []}
                    ]
                }),
                status: 200,
                ..Default::default()
            },
        );
        let (detector, repo, _) = detector(&browser);
        let workflow_id = Uuid::now_v7();

        detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("baseline");
        let baseline = repo
            .get_snapshot(workflow_id, "https://page.test")
            .await
            .expect("get")
            .expect("stored");

        // One of four paths changes text: similarity 75 >= threshold 50
        browser.set_page(
            "https://page.test",
            PageFixture {
                dom: json!({
                    "tag": "body", "attributes": {}, "children": [
                        {"tag": "h1", "attributes": {}, "text": "a", "children": []},
                        {"tag": "p", "attributes": {}, "text": "b", "children": []},
                        {"tag": "p", "attributes": {}, "text": "DIFFERENT", "children": []}
                    ]
                }),
                status: 200,
                ..Default::default()
            },
        );
        let result = detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("detect");
        assert!(!result.has_changed);

        let unchanged = repo
            .get_snapshot(workflow_id, "https://page.test")
            .await
            .expect("get")
            .expect("stored");
        assert_eq!(unchanged.content_hash, baseline.content_hash);
    }

    #[tokio::test]
    async fn test_hash_method_ignores_volatile_content() {
        let browser = StubBrowser::new();
        let config = ChangeDetectionConfig {
            method: CaptureMethod::Hash,
            urls: vec!["https://page.test".to_string()],
            threshold: 99.0,
            ..Default::default()
        };
        browser.set_page(
            "https://page.test",
            PageFixture {
                html: "<p>price 42</p><span>2024-06-01T10:00:00Z</span>".to_string(),
                status: 200,
                ..Default::default()
            },
        );
        let (detector, _, _) = detector(&browser);
        let workflow_id = Uuid::now_v7();

        detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("baseline");

        // Only the timestamp differs
        browser.set_page(
            "https://page.test",
            PageFixture {
                html: "<p>price 42</p><span>2025-01-01T00:00:00Z</span>".to_string(),
                status: 200,
                ..Default::default()
            },
        );
        let result = detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("detect");
        assert!(!result.has_changed);

        // The price change is real
        browser.set_page(
            "https://page.test",
            PageFixture {
                html: "<p>price 43</p><span>2025-01-01T00:00:00Z</span>".to_string(),
                status: 200,
                ..Default::default()
            },
        );
        let result = detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("detect");
        assert!(result.has_changed);
        assert_eq!(result.change.expect("change").kind, ChangeKind::Content);
    }

    #[tokio::test]
    async fn test_visual_method_exact_bytes() {
        let browser = StubBrowser::new();
        let config = ChangeDetectionConfig {
            method: CaptureMethod::Visual,
            urls: vec!["https://page.test".to_string()],
            threshold: 99.0,
            ..Default::default()
        };
        browser.set_page(
            "https://page.test",
            PageFixture {
                screenshot: vec![1, 2, 3],
                status: 200,
                ..Default::default()
            },
        );
        let (detector, _, _) = detector(&browser);
        let workflow_id = Uuid::now_v7();

        detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("baseline");

        browser.set_page(
            "https://page.test",
            PageFixture {
                screenshot: vec![9, 9, 9],
                status: 200,
                ..Default::default()
            },
        );
        let result = detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("detect");

        assert!(result.has_changed);
        let change = result.change.expect("change");
        assert_eq!(change.kind, ChangeKind::Visual);
        assert!((change.similarity - 0.0).abs() < f64::EPSILON);
        assert!(change.screenshot.is_some());
    }

    #[tokio::test]
    async fn test_text_method_with_ignore_patterns() {
        let browser = StubBrowser::new();
        let config = ChangeDetectionConfig {
            method: CaptureMethod::Text,
            urls: vec!["https://page.test".to_string()],
            threshold: 99.0,
            ignore_patterns: vec![r"visitors: \d+".to_string()],
            ..Default::default()
        };
        browser.set_page(
            "https://page.test",
            PageFixture::with_text("welcome\nvisitors: 100"),
        );
        let (detector, _, _) = detector(&browser);
        let workflow_id = Uuid::now_v7();

        detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("baseline");

        browser.set_page(
            "https://page.test",
            PageFixture::with_text("welcome\nvisitors: 999"),
        );
        let result = detector
            .detect(workflow_id, "https://page.test", &config)
            .await
            .expect("detect");
        assert!(!result.has_changed);
    }
}
