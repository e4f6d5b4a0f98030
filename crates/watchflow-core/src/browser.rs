//! Browser facade
//!
//! The engine drives pages through this minimal capability surface: open
//! tab, navigate, wait, evaluate script, screenshot, type, click, close.
//! The real headless engine lives outside the core; `StubBrowser` serves
//! tests and development.
//!
//! Each run owns its tab exclusively for the run's lifetime and must close
//! it on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;

/// Errors from the browser collaborator; treated as transient by callers
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("script evaluation failed: {0}")]
    Evaluation(String),

    #[error("timed out waiting: {0}")]
    Timeout(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("tab already closed")]
    Closed,

    #[error("browser protocol error: {0}")]
    Protocol(String),
}

/// Script evaluated for DOM-method captures: the body as a raw tree of
/// `{tag, attributes, text, children}` (text only on leaves)
pub const DOM_SNAPSHOT_JS: &str = r#"(() => {
  const walk = (el) => {
    const attributes = {};
    for (const a of el.attributes || []) attributes[a.name] = a.value;
    const children = Array.from(el.children).map(walk);
    const node = { tag: el.tagName.toLowerCase(), attributes, children };
    if (children.length === 0) node.text = el.textContent;
    return node;
  };
  return walk(document.body);
})()"#;

/// Script evaluated for text-method captures
pub const INNER_TEXT_JS: &str = "document.body.innerText";

/// Script evaluated for page metadata alongside every capture
pub const PAGE_METADATA_JS: &str = r#"(() => ({
  title: document.title || null,
  description: document.querySelector('meta[name="description"]')?.content || null,
  keywords: document.querySelector('meta[name="keywords"]')?.content || null,
  images: Array.from(document.images).map(i => i.src),
}))()"#;

/// Build the script used by `Tab::text_of`
pub fn text_of_script(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); return el ? el.textContent : null; }})()",
        Value::String(selector.to_string())
    )
}

/// A page tab owned by a single run
#[async_trait]
pub trait Tab: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    async fn wait_for_network_idle(&mut self, timeout: Duration) -> Result<(), BrowserError>;

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    async fn evaluate(&mut self, script: &str) -> Result<Value, BrowserError>;

    /// Raw HTML of the current document
    async fn content(&mut self) -> Result<String, BrowserError>;

    /// Full-page screenshot bytes
    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError>;

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError>;

    /// Set a field's value and fire its change event
    async fn type_text(&mut self, selector: &str, text: &str) -> Result<(), BrowserError>;

    /// HTTP status of the last main-frame navigation, when known
    async fn last_status(&mut self) -> Result<Option<u16>, BrowserError> {
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), BrowserError>;

    /// Body as a raw structural tree (see [`DOM_SNAPSHOT_JS`])
    async fn dom_snapshot(&mut self) -> Result<Value, BrowserError> {
        self.evaluate(DOM_SNAPSHOT_JS).await
    }

    /// Visible body text
    async fn inner_text(&mut self) -> Result<String, BrowserError> {
        let value = self.evaluate(INNER_TEXT_JS).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// `textContent` of the first element matching the selector
    async fn text_of(&mut self, selector: &str) -> Result<Option<String>, BrowserError> {
        let value = self.evaluate(&text_of_script(selector)).await?;
        Ok(value.as_str().map(|s| s.to_string()))
    }

    /// Raw page metadata (see [`PAGE_METADATA_JS`])
    async fn page_metadata(&mut self) -> Result<Value, BrowserError> {
        self.evaluate(PAGE_METADATA_JS).await
    }
}

/// The headless engine vending tabs
#[async_trait]
pub trait Browser: Send + Sync {
    async fn open_tab(&self) -> Result<Box<dyn Tab>, BrowserError>;
}

// ============================================================================
// Stub implementation for tests and development
// ============================================================================

/// Canned page served by [`StubBrowser`]
#[derive(Debug, Clone, Default)]
pub struct PageFixture {
    /// Raw DOM tree returned by `dom_snapshot`
    pub dom: Value,
    /// Visible text returned by `inner_text`
    pub text: String,
    /// Raw HTML returned by `content`
    pub html: String,
    /// Screenshot bytes
    pub screenshot: Vec<u8>,
    /// Raw metadata value returned by `page_metadata`
    pub metadata: Value,
    /// `textContent` per selector, also used by `wait_for_selector`
    pub selector_text: HashMap<String, String>,
    /// Results for arbitrary `evaluate` scripts
    pub evals: HashMap<String, Value>,
    /// HTTP status of the page
    pub status: u16,
}

impl PageFixture {
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: 200,
            ..Default::default()
        }
    }

    pub fn selector(mut self, selector: impl Into<String>, text: impl Into<String>) -> Self {
        self.selector_text.insert(selector.into(), text.into());
        self
    }
}

#[derive(Default)]
struct StubLog {
    clicks: Vec<(String, String)>,
    typed: Vec<(String, String, String)>,
    navigations: Vec<String>,
}

/// In-memory browser stub: serves configured fixtures per URL
#[derive(Clone, Default)]
pub struct StubBrowser {
    pages: Arc<RwLock<HashMap<String, PageFixture>>>,
    open_tabs: Arc<AtomicUsize>,
    log: Arc<Mutex<StubLog>>,
}

impl StubBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the fixture served for a URL
    pub fn set_page(&self, url: impl Into<String>, fixture: PageFixture) {
        self.pages.write().insert(url.into(), fixture);
    }

    /// Tabs currently open; a clean run always returns this to zero
    pub fn open_tab_count(&self) -> usize {
        self.open_tabs.load(Ordering::SeqCst)
    }

    pub fn clicks(&self) -> Vec<(String, String)> {
        self.log.lock().clicks.clone()
    }

    pub fn typed(&self) -> Vec<(String, String, String)> {
        self.log.lock().typed.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.log.lock().navigations.clone()
    }
}

#[async_trait]
impl Browser for StubBrowser {
    async fn open_tab(&self) -> Result<Box<dyn Tab>, BrowserError> {
        self.open_tabs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubTab {
            pages: self.pages.clone(),
            open_tabs: self.open_tabs.clone(),
            log: self.log.clone(),
            current: None,
            closed: false,
        }))
    }
}

/// Tab vended by [`StubBrowser`]
pub struct StubTab {
    pages: Arc<RwLock<HashMap<String, PageFixture>>>,
    open_tabs: Arc<AtomicUsize>,
    log: Arc<Mutex<StubLog>>,
    current: Option<String>,
    closed: bool,
}

impl StubTab {
    fn fixture(&self) -> Result<PageFixture, BrowserError> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        let url = self
            .current
            .as_ref()
            .ok_or_else(|| BrowserError::Navigation("no page loaded".to_string()))?;
        self.pages
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| BrowserError::Navigation(format!("no fixture for {url}")))
    }
}

#[async_trait]
impl Tab for StubTab {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        self.current = Some(url.to_string());
        self.log.lock().navigations.push(url.to_string());
        Ok(())
    }

    async fn wait_for_network_idle(&mut self, _timeout: Duration) -> Result<(), BrowserError> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<(), BrowserError> {
        let fixture = self.fixture()?;
        if fixture.selector_text.contains_key(selector) {
            Ok(())
        } else {
            Err(BrowserError::Timeout(format!("selector {selector}")))
        }
    }

    async fn evaluate(&mut self, script: &str) -> Result<Value, BrowserError> {
        let fixture = self.fixture()?;
        match fixture.evals.get(script) {
            Some(value) => Ok(value.clone()),
            None => Ok(Value::Null),
        }
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        Ok(self.fixture()?.html)
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        Ok(self.fixture()?.screenshot)
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        let fixture = self.fixture()?;
        if !fixture.selector_text.contains_key(selector) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        let url = self.current.clone().unwrap_or_default();
        self.log.lock().clicks.push((url, selector.to_string()));
        Ok(())
    }

    async fn type_text(&mut self, selector: &str, text: &str) -> Result<(), BrowserError> {
        // Typing into a missing field is allowed; the stub just records it
        self.fixture()?;
        let url = self.current.clone().unwrap_or_default();
        self.log
            .lock()
            .typed
            .push((url, selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn last_status(&mut self) -> Result<Option<u16>, BrowserError> {
        Ok(Some(self.fixture()?.status))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if !self.closed {
            self.closed = true;
            self.open_tabs.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn dom_snapshot(&mut self) -> Result<Value, BrowserError> {
        Ok(self.fixture()?.dom)
    }

    async fn inner_text(&mut self) -> Result<String, BrowserError> {
        Ok(self.fixture()?.text)
    }

    async fn text_of(&mut self, selector: &str) -> Result<Option<String>, BrowserError> {
        Ok(self.fixture()?.selector_text.get(selector).cloned())
    }

    async fn page_metadata(&mut self) -> Result<Value, BrowserError> {
        Ok(self.fixture()?.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tab_lifecycle() {
        let browser = StubBrowser::new();
        browser.set_page("https://example.test", PageFixture::with_text("hello"));

        let mut tab = browser.open_tab().await.expect("should open tab");
        assert_eq!(browser.open_tab_count(), 1);

        tab.navigate("https://example.test").await.expect("should navigate");
        let text = tab.inner_text().await.expect("should read text");
        assert_eq!(text, "hello");

        tab.close().await.expect("should close");
        assert_eq!(browser.open_tab_count(), 0);

        // Double close does not underflow
        tab.close().await.expect("close is idempotent");
        assert_eq!(browser.open_tab_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_tab_rejects_reads() {
        let browser = StubBrowser::new();
        browser.set_page("https://example.test", PageFixture::with_text("x"));

        let mut tab = browser.open_tab().await.expect("should open tab");
        tab.navigate("https://example.test").await.expect("should navigate");
        tab.close().await.expect("should close");

        assert!(matches!(tab.inner_text().await, Err(BrowserError::Closed)));
    }

    #[tokio::test]
    async fn test_selector_text_and_clicks() {
        let browser = StubBrowser::new();
        browser.set_page(
            "https://shop.test",
            PageFixture::with_text("shop").selector("h1", "Sale").selector("a.buy", "Buy"),
        );

        let mut tab = browser.open_tab().await.expect("should open tab");
        tab.navigate("https://shop.test").await.expect("should navigate");

        assert_eq!(
            tab.text_of("h1").await.expect("should read"),
            Some("Sale".to_string())
        );
        assert_eq!(tab.text_of("h2").await.expect("should read"), None);

        tab.click("a.buy").await.expect("should click");
        assert!(matches!(
            tab.click("a.missing").await,
            Err(BrowserError::ElementNotFound(_))
        ));
        assert_eq!(browser.clicks(), vec![("https://shop.test".to_string(), "a.buy".to_string())]);
        tab.close().await.expect("should close");
    }
}
