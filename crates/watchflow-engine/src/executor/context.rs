//! Per-run execution context
//!
//! Owns the variable map, the run's browser tab, the wall-clock deadline,
//! and the retry policy defaults. Handlers share the context; the tab is
//! behind an async mutex, variables behind a read-write lock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;
use serde_json::{Map, Value};
use tokio::sync::MutexGuard;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use watchflow_core::browser::{Browser, Tab};
use watchflow_core::retry::BackoffPolicy;

use crate::error::{EngineError, Result};

/// Shared state for one run
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub deadline: tokio::time::Instant,
    pub cancel: CancellationToken,
    pub backoff: BackoffPolicy,
    pub max_concurrent_steps: usize,
    browser: Arc<dyn Browser>,
    tab: tokio::sync::Mutex<Option<Box<dyn Tab>>>,
    variables: RwLock<Map<String, Value>>,
    extracted: RwLock<Map<String, Value>>,
    input: Option<Value>,
    http: Client,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        workflow_id: Uuid,
        browser: Arc<dyn Browser>,
        input: Option<Value>,
        timeout: Duration,
        backoff: BackoffPolicy,
        max_concurrent_steps: usize,
    ) -> Self {
        Self {
            run_id,
            workflow_id,
            deadline: tokio::time::Instant::now() + timeout,
            cancel: CancellationToken::new(),
            backoff,
            max_concurrent_steps: max_concurrent_steps.max(1),
            browser,
            tab: tokio::sync::Mutex::new(None),
            variables: RwLock::new(Map::new()),
            extracted: RwLock::new(Map::new()),
            input,
            http: Client::new(),
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.write().insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    pub fn record_extracted(&self, name: impl Into<String>, value: Value) {
        self.extracted.write().insert(name.into(), value);
    }

    /// Everything extract steps gathered so far
    pub fn extracted_data(&self) -> Value {
        Value::Object(self.extracted.read().clone())
    }

    /// The value templates and conditions resolve against: variables at
    /// top level plus `variables`, `extractedData`, and `input`
    pub fn context_value(&self) -> Value {
        let variables = self.variables.read().clone();
        let mut root = variables.clone();
        root.insert("variables".to_string(), Value::Object(variables));
        root.insert("extractedData".to_string(), self.extracted_data());
        root.insert(
            "input".to_string(),
            self.input.clone().unwrap_or(Value::Null),
        );
        Value::Object(root)
    }

    /// Lock the tab slot; pair with [`ExecutionContext::ensure_tab`]
    pub async fn lock_tab(&self) -> MutexGuard<'_, Option<Box<dyn Tab>>> {
        self.tab.lock().await
    }

    /// Open the run's tab on first use
    pub async fn ensure_tab<'g>(
        &self,
        guard: &'g mut MutexGuard<'_, Option<Box<dyn Tab>>>,
    ) -> Result<&'g mut Box<dyn Tab>> {
        if guard.is_none() {
            **guard = Some(self.browser.open_tab().await?);
        }
        match guard.as_mut() {
            Some(tab) => Ok(tab),
            None => Err(EngineError::external("browser tab unavailable")),
        }
    }

    /// Close the tab; called on every run exit path
    pub async fn close_tab(&self) {
        if let Some(mut tab) = self.tab.lock().await.take() {
            let _ = tab.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watchflow_core::browser::StubBrowser;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Arc::new(StubBrowser::new()),
            Some(json!({"payload": 1})),
            Duration::from_secs(60),
            BackoffPolicy::default(),
            1,
        )
    }

    #[test]
    fn test_context_value_shape() {
        let ctx = ctx();
        ctx.set_variable("status", json!("open"));
        ctx.record_extracted("title", json!("A"));

        let value = ctx.context_value();
        assert_eq!(value["status"], "open");
        assert_eq!(value["variables"]["status"], "open");
        assert_eq!(value["extractedData"]["title"], "A");
        assert_eq!(value["input"]["payload"], 1);
    }

    #[tokio::test]
    async fn test_tab_opened_once_and_closed() {
        let browser = StubBrowser::new();
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Arc::new(browser.clone()),
            None,
            Duration::from_secs(60),
            BackoffPolicy::default(),
            1,
        );

        {
            let mut guard = ctx.lock_tab().await;
            ctx.ensure_tab(&mut guard).await.expect("should open");
        }
        {
            let mut guard = ctx.lock_tab().await;
            ctx.ensure_tab(&mut guard).await.expect("should reuse");
        }
        assert_eq!(browser.open_tab_count(), 1);

        ctx.close_tab().await;
        assert_eq!(browser.open_tab_count(), 0);
    }
}
