//! Built-in action handlers

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use watchflow_core::bus::{EngineEvent, IntegrationReply};
use watchflow_core::model::Action;
use watchflow_core::outbound::{PullRequestSpec, VcsKind};
use watchflow_core::template;

use super::{ActionContext, ActionFailure, ActionHandler, ActionPipeline, ActionResult, InlineAction};
use crate::executor::condition;

const INTEGRATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 5_000;

fn parse_config<T: serde::de::DeserializeOwned>(action: &Action) -> Result<T, ActionFailure> {
    serde_json::from_value(action.config.clone()).map_err(|e| {
        ActionFailure::Fatal(format!("invalid {} config: {e}", action.kind.as_str()))
    })
}

// ============================================================================
// run_playbook
// ============================================================================

#[derive(Deserialize)]
struct RunPlaybookConfig {
    playbook_id: Uuid,
}

pub(super) struct RunPlaybookHandler;

#[async_trait]
impl ActionHandler for RunPlaybookHandler {
    async fn execute(
        &self,
        action: &Action,
        ctx: &ActionContext,
        _pipeline: &ActionPipeline,
    ) -> ActionResult {
        let config: RunPlaybookConfig = parse_config(action)?;
        ctx.adapters
            .agent
            .run_playbook(config.playbook_id, ctx.value())
            .await
            .map_err(|e| ActionFailure::Retryable(e.to_string()))
    }
}

// ============================================================================
// notify
// ============================================================================

fn default_channel() -> String {
    "email".to_string()
}

#[derive(Deserialize)]
struct NotifyConfig {
    #[serde(default = "default_channel")]
    channel: String,
    #[serde(default)]
    recipients: Vec<String>,
    #[serde(default)]
    template: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    webhook_url: Option<String>,
}

pub(super) struct NotifyHandler;

impl NotifyHandler {
    async fn post_json(
        ctx: &ActionContext,
        url: &str,
        body: Value,
    ) -> Result<Value, ActionFailure> {
        let response = ctx
            .http()
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ActionFailure::Retryable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ActionFailure::Retryable(format!(
                "notify webhook returned {status}"
            )));
        }
        let text = response.text().await.unwrap_or_default();
        Ok(serde_json::from_str(&text).unwrap_or(json!({"status": status.as_u16()})))
    }
}

#[async_trait]
impl ActionHandler for NotifyHandler {
    async fn execute(
        &self,
        action: &Action,
        ctx: &ActionContext,
        _pipeline: &ActionPipeline,
    ) -> ActionResult {
        let config: NotifyConfig = parse_config(action)?;
        let message = &config.template;

        match config.channel.as_str() {
            "email" => {
                let subject = config.subject.as_deref().unwrap_or("Watchflow notification");
                ctx.adapters
                    .email
                    .send(&config.recipients, subject, message)
                    .await
                    .map_err(|e| ActionFailure::Retryable(e.to_string()))
            }
            "sms" => ctx
                .adapters
                .sms
                .send(&config.recipients, message)
                .await
                .map_err(|e| ActionFailure::Retryable(e.to_string())),
            "slack" => {
                let url = config.webhook_url.as_deref().ok_or_else(|| {
                    ActionFailure::Fatal("slack notify needs webhook_url".to_string())
                })?;
                Self::post_json(ctx, url, json!({"text": message})).await
            }
            "discord" => {
                let url = config.webhook_url.as_deref().ok_or_else(|| {
                    ActionFailure::Fatal("discord notify needs webhook_url".to_string())
                })?;
                Self::post_json(ctx, url, json!({"content": message})).await
            }
            "webhook" => {
                let url = config.webhook_url.as_deref().ok_or_else(|| {
                    ActionFailure::Fatal("webhook notify needs webhook_url".to_string())
                })?;
                Self::post_json(ctx, url, ctx.value()).await
            }
            other => Err(ActionFailure::Fatal(format!(
                "unknown notify channel: {other}"
            ))),
        }
    }
}

// ============================================================================
// create_pr
// ============================================================================

fn default_base() -> String {
    "main".to_string()
}

#[derive(Deserialize)]
struct CreatePrConfig {
    repository: String,
    branch: String,
    #[serde(default = "default_base")]
    base: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
}

pub(super) struct CreatePrHandler;

#[async_trait]
impl ActionHandler for CreatePrHandler {
    async fn execute(
        &self,
        action: &Action,
        ctx: &ActionContext,
        _pipeline: &ActionPipeline,
    ) -> ActionResult {
        let config: CreatePrConfig = parse_config(action)?;
        let provider = VcsKind::infer(&config.repository).ok_or_else(|| {
            ActionFailure::Fatal(format!(
                "cannot infer VCS provider from {:?}",
                config.repository
            ))
        })?;

        let spec = PullRequestSpec {
            provider,
            repository: config.repository,
            branch: config.branch,
            base: config.base,
            title: config.title,
            body: config.body,
        };
        ctx.adapters
            .vcs
            .open_pull_request(&spec)
            .await
            .map_err(|e| ActionFailure::Retryable(e.to_string()))
    }
}

// ============================================================================
// webhook
// ============================================================================

#[derive(Deserialize)]
struct WebhookConfig {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

pub(super) struct WebhookHandler;

#[async_trait]
impl ActionHandler for WebhookHandler {
    async fn execute(
        &self,
        action: &Action,
        ctx: &ActionContext,
        _pipeline: &ActionPipeline,
    ) -> ActionResult {
        let config: WebhookConfig = parse_config(action)?;
        let method = config
            .method
            .as_deref()
            .unwrap_or("POST")
            .parse::<reqwest::Method>()
            .map_err(|_| ActionFailure::Fatal(format!("bad webhook method {:?}", config.method)))?;

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
            .map_err(|e| ActionFailure::Retryable(e.to_string()))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ActionFailure::Retryable(format!(
                "webhook returned {status}: {text}"
            )));
        }
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(json!({"status": status.as_u16(), "body": body}))
    }
}

// ============================================================================
// export
// ============================================================================

#[derive(Deserialize)]
struct ExportConfig {
    #[serde(default = "default_export_format")]
    format: String,
    path: String,
}

fn default_export_format() -> String {
    "json".to_string()
}

pub(super) struct ExportHandler;

impl ExportHandler {
    /// Flat CSV over an object (one row) or an array of objects
    fn to_csv(data: &Value) -> String {
        let rows: Vec<&serde_json::Map<String, Value>> = match data {
            Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
            Value::Object(map) => vec![map],
            _ => vec![],
        };
        if rows.is_empty() {
            return String::new();
        }

        let mut columns: Vec<&String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.contains(&key) {
                    columns.push(key);
                }
            }
        }

        let escape = |value: &str| -> String {
            if value.contains([',', '"', '\n']) {
                format!("\"{}\"", value.replace('"', "\"\""))
            } else {
                value.to_string()
            }
        };

        let mut out = columns
            .iter()
            .map(|c| escape(c))
            .collect::<Vec<_>>()
            .join(",");
        out.push('\n');
        for row in rows {
            let line = columns
                .iter()
                .map(|col| {
                    row.get(*col)
                        .map(|v| match v {
                            Value::String(s) => escape(s),
                            other => escape(&other.to_string()),
                        })
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

#[async_trait]
impl ActionHandler for ExportHandler {
    async fn execute(
        &self,
        action: &Action,
        ctx: &ActionContext,
        _pipeline: &ActionPipeline,
    ) -> ActionResult {
        let config: ExportConfig = parse_config(action)?;
        let context = ctx.value();
        let data = context.get("extractedData").cloned().unwrap_or(Value::Null);

        let content = match config.format.as_str() {
            "json" => serde_json::to_string_pretty(&data)
                .map_err(|e| ActionFailure::Fatal(e.to_string()))?,
            // Spreadsheet/document formats fall back to CSV content; real
            // converters live behind outbound adapters
            "csv" | "excel" | "pdf" => Self::to_csv(&data),
            other => {
                return Err(ActionFailure::Fatal(format!(
                    "unknown export format: {other}"
                )));
            }
        };

        if let Some(parent) = Path::new(&config.path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ActionFailure::Retryable(e.to_string()))?;
        }
        tokio::fs::write(&config.path, content.as_bytes())
            .await
            .map_err(|e| ActionFailure::Retryable(e.to_string()))?;

        Ok(json!({
            "format": config.format,
            "path": config.path,
            "size": content.len(),
        }))
    }
}

// ============================================================================
// script
// ============================================================================

fn default_language() -> String {
    "javascript".to_string()
}

#[derive(Deserialize)]
struct ScriptConfig {
    #[serde(default = "default_language")]
    language: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    sandbox: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

pub(super) struct ScriptHandler;

#[async_trait]
impl ActionHandler for ScriptHandler {
    async fn execute(
        &self,
        action: &Action,
        ctx: &ActionContext,
        _pipeline: &ActionPipeline,
    ) -> ActionResult {
        let config: ScriptConfig = parse_config(action)?;
        if !matches!(config.language.as_str(), "javascript" | "js") {
            return Err(ActionFailure::Fatal(format!(
                "script language {:?} not supported, only JavaScript",
                config.language
            )));
        }

        let time_limit = config.sandbox.then(|| {
            Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_SCRIPT_TIMEOUT_MS))
        });
        ctx.adapters
            .agent
            .evaluate_script(&config.source, ctx.value(), time_limit)
            .await
            .map_err(|e| ActionFailure::Retryable(e.to_string()))
    }
}

// ============================================================================
// integration
// ============================================================================

#[derive(Deserialize)]
struct IntegrationConfig {
    name: String,
    #[serde(default)]
    config: Value,
}

pub(super) struct IntegrationHandler;

#[async_trait]
impl ActionHandler for IntegrationHandler {
    async fn execute(
        &self,
        action: &Action,
        ctx: &ActionContext,
        _pipeline: &ActionPipeline,
    ) -> ActionResult {
        let config: IntegrationConfig = parse_config(action)?;
        let (reply, rx) = IntegrationReply::channel();
        ctx.bus.publish(EngineEvent::IntegrationExecute {
            name: config.name.clone(),
            config: config.config,
            context: ctx.value(),
            reply,
        });

        match tokio::time::timeout(INTEGRATION_TIMEOUT, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ActionFailure::Retryable(format!(
                "no handler answered integration {:?}",
                config.name
            ))),
            Err(_) => Err(ActionFailure::Retryable(format!(
                "integration {:?} timed out",
                config.name
            ))),
        }
    }
}

// ============================================================================
// conditional
// ============================================================================

#[derive(Deserialize)]
struct ConditionalConfig {
    condition: Value,
    #[serde(default)]
    if_true: Option<InlineAction>,
    #[serde(default)]
    if_false: Option<InlineAction>,
}

pub(super) struct ConditionalHandler;

#[async_trait]
impl ActionHandler for ConditionalHandler {
    async fn execute(
        &self,
        action: &Action,
        ctx: &ActionContext,
        pipeline: &ActionPipeline,
    ) -> ActionResult {
        let config: ConditionalConfig = parse_config(action)?;
        let matched = condition::evaluate(&config.condition, &ctx.value())
            .map_err(|e| ActionFailure::Fatal(e.to_string()))?;

        let branch = if matched {
            config.if_true
        } else {
            config.if_false
        };
        match branch {
            Some(inline) => {
                let output = pipeline.dispatch_inline(&inline, ctx).await?;
                Ok(json!({
                    "condition": matched,
                    "executed": inline.kind,
                    "output": output,
                }))
            }
            None => Ok(json!({"condition": matched, "executed": Value::Null})),
        }
    }
}

// ============================================================================
// loop
// ============================================================================

#[derive(Deserialize)]
struct LoopConfig {
    /// Inline array, or a string context reference to one
    items: Value,
    #[serde(default)]
    parallel: bool,
    action: InlineAction,
}

pub(super) struct LoopHandler;

#[async_trait]
impl ActionHandler for LoopHandler {
    async fn execute(
        &self,
        action: &Action,
        ctx: &ActionContext,
        pipeline: &ActionPipeline,
    ) -> ActionResult {
        let config: LoopConfig = parse_config(action)?;
        let items: Vec<Value> = match &config.items {
            Value::Array(items) => items.clone(),
            Value::String(path) => {
                let context = ctx.value();
                template::resolve_path(&context, path)
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| {
                        ActionFailure::Fatal(format!("loop items {path:?} is not an array"))
                    })?
            }
            other => {
                return Err(ActionFailure::Fatal(format!(
                    "loop items must be an array or reference, got {other}"
                )));
            }
        };

        let mut results = Vec::with_capacity(items.len());
        if config.parallel {
            // Pre-render each iteration's body against an overlay context
            // so parallel iterations do not race on the shared variables
            let base = ctx.value();
            let futures = items.iter().enumerate().map(|(index, item)| {
                let mut overlay = base.as_object().cloned().unwrap_or_default();
                overlay.insert("loopIndex".to_string(), json!(index));
                overlay.insert("loopItem".to_string(), item.clone());
                let rendered = InlineAction {
                    kind: config.action.kind,
                    config: template::render_value(&config.action.config, &Value::Object(overlay)),
                };
                async move { pipeline.dispatch_inline(&rendered, ctx).await }
            });
            for (index, outcome) in join_all(futures).await.into_iter().enumerate() {
                match outcome {
                    Ok(output) => results.push(json!({"iteration": index, "output": output})),
                    Err(e) => return Err(ActionFailure::Retryable(e.to_string())),
                }
            }
        } else {
            for (index, item) in items.iter().enumerate() {
                ctx.insert("loopIndex", json!(index));
                ctx.insert("loopItem", item.clone());
                let output = pipeline.dispatch_inline(&config.action, ctx).await?;
                results.push(json!({"iteration": index, "output": output}));
            }
        }

        Ok(json!({"iterations": items.len(), "results": results}))
    }
}

// ============================================================================
// delay
// ============================================================================

#[derive(Deserialize)]
struct DelayConfig {
    duration_ms: u64,
}

pub(super) struct DelayHandler;

#[async_trait]
impl ActionHandler for DelayHandler {
    async fn execute(
        &self,
        action: &Action,
        _ctx: &ActionContext,
        _pipeline: &ActionPipeline,
    ) -> ActionResult {
        let config: DelayConfig = parse_config(action)?;
        tokio::time::sleep(Duration::from_millis(config.duration_ms)).await;
        Ok(json!({"delayed_ms": config.duration_ms}))
    }
}
