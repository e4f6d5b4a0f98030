//! Built-in step handlers
//!
//! Each handler is a pure function of its (already templated) config plus
//! the execution context. Browser and HTTP failures are retryable; config
//! errors are fatal.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use watchflow_core::browser::BrowserError;
use watchflow_core::model::StepDefinition;
use watchflow_core::template;

use super::condition;
use super::context::ExecutionContext;
use super::{StepExecutor, StepFailure, StepHandler, StepResult};

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const NETWORK_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

impl From<BrowserError> for StepFailure {
    fn from(e: BrowserError) -> Self {
        StepFailure::Retryable(e.to_string())
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(step: &StepDefinition) -> Result<T, StepFailure> {
    serde_json::from_value(step.config.clone()).map_err(|e| {
        StepFailure::Fatal(format!("invalid {} config: {e}", step.kind.as_str()))
    })
}

// ============================================================================
// navigate
// ============================================================================

#[derive(Deserialize)]
struct NavigateConfig {
    url: String,
}

pub(super) struct NavigateHandler;

#[async_trait]
impl StepHandler for NavigateHandler {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        _driver: &StepExecutor,
    ) -> StepResult {
        let config: NavigateConfig = parse_config(step)?;
        let mut guard = ctx.lock_tab().await;
        let tab = ctx
            .ensure_tab(&mut guard)
            .await
            .map_err(|e| StepFailure::Retryable(e.to_string()))?;
        tab.navigate(&config.url).await?;
        tab.wait_for_network_idle(NETWORK_IDLE_TIMEOUT).await?;
        Ok(json!({"url": config.url, "timestamp": Utc::now()}))
    }
}

// ============================================================================
// wait
// ============================================================================

#[derive(Deserialize)]
struct WaitConfig {
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

pub(super) struct WaitHandler;

#[async_trait]
impl StepHandler for WaitHandler {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        _driver: &StepExecutor,
    ) -> StepResult {
        let config: WaitConfig = parse_config(step)?;
        match (config.duration_ms, config.selector) {
            (Some(ms), _) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            (None, Some(selector)) => {
                let timeout = config
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_WAIT_TIMEOUT);
                let mut guard = ctx.lock_tab().await;
                let tab = ctx
                    .ensure_tab(&mut guard)
                    .await
                    .map_err(|e| StepFailure::Retryable(e.to_string()))?;
                tab.wait_for_selector(&selector, timeout).await?;
            }
            (None, None) => {
                return Err(StepFailure::Fatal(
                    "wait step needs duration_ms or selector".to_string(),
                ));
            }
        }
        Ok(json!({}))
    }
}

// ============================================================================
// click
// ============================================================================

#[derive(Deserialize)]
struct ClickConfig {
    selector: String,
}

pub(super) struct ClickHandler;

#[async_trait]
impl StepHandler for ClickHandler {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        _driver: &StepExecutor,
    ) -> StepResult {
        let config: ClickConfig = parse_config(step)?;
        let mut guard = ctx.lock_tab().await;
        let tab = ctx
            .ensure_tab(&mut guard)
            .await
            .map_err(|e| StepFailure::Retryable(e.to_string()))?;
        tab.click(&config.selector).await?;
        Ok(json!({"selector": config.selector}))
    }
}

// ============================================================================
// fill
// ============================================================================

#[derive(Deserialize)]
struct FillConfig {
    fields: HashMap<String, String>,
}

pub(super) struct FillHandler;

#[async_trait]
impl StepHandler for FillHandler {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        _driver: &StepExecutor,
    ) -> StepResult {
        let config: FillConfig = parse_config(step)?;
        let mut guard = ctx.lock_tab().await;
        let tab = ctx
            .ensure_tab(&mut guard)
            .await
            .map_err(|e| StepFailure::Retryable(e.to_string()))?;
        for (selector, value) in &config.fields {
            tab.type_text(selector, value).await?;
        }
        Ok(json!({"count": config.fields.len()}))
    }
}

// ============================================================================
// extract
// ============================================================================

pub(super) struct ExtractHandler;

impl ExtractHandler {
    /// Config is either `{"selectors": {name: selector}}` or a bare
    /// name-to-selector map
    fn selectors(step: &StepDefinition) -> Result<Vec<(String, String)>, StepFailure> {
        let map = step
            .config
            .get("selectors")
            .and_then(Value::as_object)
            .or_else(|| step.config.as_object())
            .ok_or_else(|| {
                StepFailure::Fatal("extract step needs a name -> selector map".to_string())
            })?;
        Ok(map
            .iter()
            .filter_map(|(name, sel)| sel.as_str().map(|s| (name.clone(), s.to_string())))
            .collect())
    }
}

#[async_trait]
impl StepHandler for ExtractHandler {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        _driver: &StepExecutor,
    ) -> StepResult {
        let selectors = Self::selectors(step)?;
        let mut guard = ctx.lock_tab().await;
        let tab = ctx
            .ensure_tab(&mut guard)
            .await
            .map_err(|e| StepFailure::Retryable(e.to_string()))?;

        let mut output = Map::new();
        for (name, selector) in selectors {
            let text = tab.text_of(&selector).await?;
            let value = text.map(Value::String).unwrap_or(Value::Null);
            ctx.record_extracted(name.clone(), value.clone());
            output.insert(name, value);
        }
        Ok(Value::Object(output))
    }
}

// ============================================================================
// condition
// ============================================================================

pub(super) struct ConditionHandler;

#[async_trait]
impl StepHandler for ConditionHandler {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        _driver: &StepExecutor,
    ) -> StepResult {
        let result = condition::evaluate(&step.config, &ctx.context_value())
            .map_err(|e| StepFailure::Fatal(e.to_string()))?;
        Ok(json!({"result": result}))
    }
}

// ============================================================================
// loop
// ============================================================================

#[derive(Deserialize)]
struct LoopConfig {
    #[serde(default)]
    iterations: Option<u64>,
    /// Context path to an array to iterate
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    steps: Vec<StepDefinition>,
    #[serde(default)]
    continue_on_error: bool,
}

pub(super) struct LoopHandler;

#[async_trait]
impl StepHandler for LoopHandler {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        driver: &StepExecutor,
    ) -> StepResult {
        let config: LoopConfig = parse_config(step)?;

        let items: Vec<Value> = match (&config.collection, config.iterations) {
            (Some(path), _) => {
                let context = ctx.context_value();
                template::resolve_path(&context, path)
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| {
                        StepFailure::Fatal(format!("loop collection {path:?} is not an array"))
                    })?
            }
            (None, Some(n)) => (0..n).map(|i| json!(i)).collect(),
            (None, None) => {
                return Err(StepFailure::Fatal(
                    "loop step needs iterations or collection".to_string(),
                ));
            }
        };

        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            ctx.set_variable("loopIndex", json!(index));
            ctx.set_variable("loopItem", item.clone());
            match driver.run_children(&config.steps, ctx).await {
                Ok(iteration) => results.push(json!({"iteration": index, "results": iteration})),
                Err(e) if config.continue_on_error => {
                    results.push(json!({"iteration": index, "error": e.to_string()}));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(json!({"iterations": items.len(), "results": results}))
    }
}

// ============================================================================
// screenshot
// ============================================================================

pub(super) struct ScreenshotHandler;

#[async_trait]
impl StepHandler for ScreenshotHandler {
    async fn execute(
        &self,
        _step: &StepDefinition,
        ctx: &ExecutionContext,
        _driver: &StepExecutor,
    ) -> StepResult {
        let mut guard = ctx.lock_tab().await;
        let tab = ctx
            .ensure_tab(&mut guard)
            .await
            .map_err(|e| StepFailure::Retryable(e.to_string()))?;
        let bytes = tab.screenshot().await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(json!({"image": encoded}))
    }
}

// ============================================================================
// api
// ============================================================================

#[derive(Deserialize)]
struct ApiConfig {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

pub(super) struct ApiHandler;

#[async_trait]
impl StepHandler for ApiHandler {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        _driver: &StepExecutor,
    ) -> StepResult {
        let config: ApiConfig = parse_config(step)?;
        let method = config
            .method
            .as_deref()
            .unwrap_or("GET")
            .parse::<reqwest::Method>()
            .map_err(|_| StepFailure::Fatal(format!("bad api method {:?}", config.method)))?;

        let mut request = ctx.http().request(method, &config.url);
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &config.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StepFailure::Retryable(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| StepFailure::Retryable(e.to_string()))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(json!({"status": status, "body": body}))
    }
}

// ============================================================================
// store
// ============================================================================

#[derive(Deserialize)]
struct StoreConfig {
    variable: String,
    #[serde(default)]
    value: Option<Value>,
    /// Context path copied when no literal value is given
    #[serde(default)]
    source: Option<String>,
}

pub(super) struct StoreHandler;

#[async_trait]
impl StepHandler for StoreHandler {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        _driver: &StepExecutor,
    ) -> StepResult {
        let config: StoreConfig = parse_config(step)?;
        let value = match (config.value, config.source) {
            (Some(value), _) => value,
            (None, Some(path)) => {
                let context = ctx.context_value();
                template::resolve_path(&context, &path)
                    .cloned()
                    .unwrap_or(Value::Null)
            }
            (None, None) => {
                return Err(StepFailure::Fatal(
                    "store step needs value or source".to_string(),
                ));
            }
        };
        ctx.set_variable(config.variable.clone(), value.clone());
        Ok(json!({"variable": config.variable, "value": value}))
    }
}
