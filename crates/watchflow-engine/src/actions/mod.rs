//! Action pipeline
//!
//! Runs after a successful run. Actions execute strictly in order with
//! the same exponential-backoff retry shape as steps; each success writes
//! its output into the run context under `action_<id>` (and an
//! `action_<kind>` alias) so subsequent actions can template from it. A
//! failure aborts the remaining pipeline unless `continue_on_error` is
//! set; the run itself stays successful either way.

mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use watchflow_core::bus::{EngineEvent, EventBus};
use watchflow_core::model::{Action, ActionKind, ActionOutcome, ActionRecord};
use watchflow_core::outbound::{AgentDispatcher, EmailSender, SmsSender, VcsProvider};
use watchflow_core::retry::BackoffPolicy;
use watchflow_core::template;

/// Typed outcome of one action attempt
#[derive(Debug)]
pub enum ActionFailure {
    Retryable(String),
    Fatal(String),
}

impl std::fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionFailure::Retryable(msg) | ActionFailure::Fatal(msg) => f.write_str(msg),
        }
    }
}

pub type ActionResult = std::result::Result<Value, ActionFailure>;

/// The outbound collaborators the pipeline dispatches to
#[derive(Clone)]
pub struct OutboundAdapters {
    pub agent: Arc<dyn AgentDispatcher>,
    pub email: Arc<dyn EmailSender>,
    pub sms: Arc<dyn SmsSender>,
    pub vcs: Arc<dyn VcsProvider>,
}

/// Mutable run context the pipeline templates against
pub struct ActionContext {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub adapters: OutboundAdapters,
    pub bus: EventBus,
    pub cancel: CancellationToken,
    data: RwLock<Map<String, Value>>,
    http: Client,
}

impl ActionContext {
    pub fn new(
        run_id: Uuid,
        workflow_id: Uuid,
        initial: Map<String, Value>,
        adapters: OutboundAdapters,
        bus: EventBus,
    ) -> Self {
        Self {
            run_id,
            workflow_id,
            adapters,
            bus,
            cancel: CancellationToken::new(),
            data: RwLock::new(initial),
            http: Client::new(),
        }
    }

    pub fn value(&self) -> Value {
        Value::Object(self.data.read().clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.data.write().insert(key.into(), value);
    }

    pub fn http(&self) -> &Client {
        &self.http
    }
}

/// An action body nested inside conditional/loop configs
#[derive(Debug, Clone, Deserialize)]
pub struct InlineAction {
    pub kind: ActionKind,
    #[serde(default)]
    pub config: Value,
}

impl InlineAction {
    fn to_action(&self, workflow_id: Uuid) -> Action {
        Action::new(workflow_id, self.kind, 0, self.config.clone())
    }
}

/// One action kind's implementation
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(
        &self,
        action: &Action,
        ctx: &ActionContext,
        pipeline: &ActionPipeline,
    ) -> ActionResult;
}

/// The pipeline driver: registry of kind -> handler plus the ordered loop
pub struct ActionPipeline {
    registry: HashMap<ActionKind, Arc<dyn ActionHandler>>,
    bus: EventBus,
}

impl ActionPipeline {
    pub fn new(bus: EventBus) -> Self {
        let mut pipeline = Self {
            registry: HashMap::new(),
            bus,
        };
        pipeline.register(ActionKind::RunPlaybook, Arc::new(handlers::RunPlaybookHandler));
        pipeline.register(ActionKind::Notify, Arc::new(handlers::NotifyHandler));
        pipeline.register(ActionKind::CreatePr, Arc::new(handlers::CreatePrHandler));
        pipeline.register(ActionKind::Webhook, Arc::new(handlers::WebhookHandler));
        pipeline.register(ActionKind::Export, Arc::new(handlers::ExportHandler));
        pipeline.register(ActionKind::Script, Arc::new(handlers::ScriptHandler));
        pipeline.register(ActionKind::Integration, Arc::new(handlers::IntegrationHandler));
        pipeline.register(ActionKind::Conditional, Arc::new(handlers::ConditionalHandler));
        pipeline.register(ActionKind::Loop, Arc::new(handlers::LoopHandler));
        pipeline.register(ActionKind::Delay, Arc::new(handlers::DelayHandler));
        pipeline
    }

    pub fn register(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) {
        self.registry.insert(kind, handler);
    }

    /// Run the ordered pipeline; the returned records mirror
    /// `run.actions_executed`
    #[instrument(skip_all, fields(run_id = %ctx.run_id, actions = actions.len()))]
    pub async fn run(&self, actions: &[Action], ctx: &ActionContext) -> Vec<ActionRecord> {
        let mut records = Vec::with_capacity(actions.len());
        for action in actions {
            if !action.enabled {
                records.push(ActionRecord {
                    action_id: action.id,
                    kind: action.kind,
                    outcome: ActionOutcome::Skipped,
                    output: None,
                    error: None,
                    duration_ms: 0,
                });
                continue;
            }

            let record = self.execute_action(action, ctx).await;
            let failed = record.outcome == ActionOutcome::Failed;
            records.push(record);
            if failed && !action.continue_on_error {
                warn!(action_id = %action.id, "action failed, aborting remaining pipeline");
                break;
            }
        }
        records
    }

    async fn execute_action(&self, action: &Action, ctx: &ActionContext) -> ActionRecord {
        let started = Instant::now();
        let policy = if action.retry_on_failure {
            BackoffPolicy::new(action.retry_attempts, action.retry_delay_ms)
        } else {
            BackoffPolicy::none()
        };

        let mut retries = 0u32;
        let outcome = loop {
            match self.dispatch(action, ctx).await {
                Ok(output) => break Ok(output),
                Err(ActionFailure::Fatal(error)) => break Err(error),
                Err(ActionFailure::Retryable(error)) => {
                    if !policy.has_retries_remaining(retries) {
                        break Err(error);
                    }
                    debug!(action_id = %action.id, retry = retries + 1, "retrying action");
                    let delay = policy.delay_for_retry(retries);
                    retries += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => {
                ctx.insert(format!("action_{}", action.id), output.clone());
                ctx.insert(format!("action_{}", action.kind.as_str()), output.clone());
                self.bus.publish(EngineEvent::ActionCompleted {
                    run_id: ctx.run_id,
                    action_id: action.id,
                    kind: action.kind,
                });
                ActionRecord {
                    action_id: action.id,
                    kind: action.kind,
                    outcome: ActionOutcome::Success,
                    output: Some(output),
                    error: None,
                    duration_ms,
                }
            }
            Err(error) => {
                self.bus.publish(EngineEvent::ActionFailed {
                    run_id: ctx.run_id,
                    action_id: action.id,
                    kind: action.kind,
                    error: error.clone(),
                });
                ActionRecord {
                    action_id: action.id,
                    kind: action.kind,
                    outcome: ActionOutcome::Failed,
                    output: None,
                    error: Some(error),
                    duration_ms,
                }
            }
        }
    }

    /// Render templates and invoke the kind's handler once
    pub(crate) async fn dispatch(&self, action: &Action, ctx: &ActionContext) -> ActionResult {
        let handler = self.registry.get(&action.kind).ok_or_else(|| {
            ActionFailure::Fatal(format!("no handler for action kind {}", action.kind.as_str()))
        })?;
        let rendered = Action {
            config: template::render_value(&action.config, &ctx.value()),
            ..action.clone()
        };
        handler.execute(&rendered, ctx, self).await
    }

    /// Dispatch a nested action body (conditional/loop recursion)
    pub(crate) async fn dispatch_inline(
        &self,
        inline: &InlineAction,
        ctx: &ActionContext,
    ) -> ActionResult {
        let action = inline.to_action(ctx.workflow_id);
        self.dispatch(&action, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watchflow_core::outbound::{
        RecordingEmailSender, RecordingSmsSender, RecordingVcsProvider, StubAgentDispatcher,
    };
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapters() -> (OutboundAdapters, RecordingEmailSender) {
        let email = RecordingEmailSender::new();
        (
            OutboundAdapters {
                agent: Arc::new(StubAgentDispatcher::new()),
                email: Arc::new(email.clone()),
                sms: Arc::new(RecordingSmsSender::new()),
                vcs: Arc::new(RecordingVcsProvider::new()),
            },
            email,
        )
    }

    fn context(initial: Map<String, Value>) -> (ActionContext, RecordingEmailSender) {
        let (adapters, email) = adapters();
        (
            ActionContext::new(
                Uuid::now_v7(),
                Uuid::now_v7(),
                initial,
                adapters,
                EventBus::default(),
            ),
            email,
        )
    }

    fn initial_with_extracted(extracted: Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("extractedData".to_string(), extracted);
        map
    }

    #[tokio::test]
    async fn test_notify_then_webhook_templates_prior_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({"v": "m7"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (ctx, email) = context(initial_with_extracted(json!({"title": "A"})));
        email.set_response(Ok(json!({"id": "m7"})));

        let workflow_id = ctx.workflow_id;
        let notify = Action::new(
            workflow_id,
            ActionKind::Notify,
            0,
            json!({
                "channel": "email",
                "recipients": ["ops@example.test"],
                "template": "Got {{extractedData.title}}",
            }),
        );
        let webhook = Action::new(
            workflow_id,
            ActionKind::Webhook,
            1,
            json!({
                "url": format!("{}/hook", server.uri()),
                "body": {"v": "{{action_notify.id}}"},
            }),
        );

        let pipeline = ActionPipeline::new(EventBus::default());
        let records = pipeline.run(&[notify, webhook], &ctx).await;

        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.outcome == ActionOutcome::Success));
        let sent = email.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, "Got A");
    }

    #[tokio::test]
    async fn test_failed_action_aborts_pipeline() {
        let server = MockServer::start().await;
        // The webhook endpoint must never be called
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (ctx, email) = context(Map::new());
        email.set_response(Err("smtp unavailable".to_string()));

        let workflow_id = ctx.workflow_id;
        let notify = Action::new(
            workflow_id,
            ActionKind::Notify,
            0,
            json!({
                "channel": "email",
                "recipients": ["ops@example.test"],
                "template": "x",
            }),
        );
        let webhook = Action::new(
            workflow_id,
            ActionKind::Webhook,
            1,
            json!({"url": format!("{}/hook", server.uri())}),
        );

        let pipeline = ActionPipeline::new(EventBus::default());
        let records = pipeline.run(&[notify, webhook], &ctx).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, ActionOutcome::Failed);
        assert!(records[0].error.as_deref().unwrap_or("").contains("smtp"));
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_going() {
        let (ctx, email) = context(Map::new());
        email.set_response(Err("down".to_string()));

        let workflow_id = ctx.workflow_id;
        let mut notify = Action::new(
            workflow_id,
            ActionKind::Notify,
            0,
            json!({"channel": "email", "recipients": [], "template": "x"}),
        );
        notify.continue_on_error = true;
        let delay = Action::new(workflow_id, ActionKind::Delay, 1, json!({"duration_ms": 1}));

        let pipeline = ActionPipeline::new(EventBus::default());
        let records = pipeline.run(&[notify, delay], &ctx).await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, ActionOutcome::Failed);
        assert_eq!(records[1].outcome, ActionOutcome::Success);
    }

    #[tokio::test]
    async fn test_disabled_action_skipped() {
        let (ctx, _) = context(Map::new());
        let mut delay = Action::new(
            ctx.workflow_id,
            ActionKind::Delay,
            0,
            json!({"duration_ms": 1}),
        );
        delay.enabled = false;

        let pipeline = ActionPipeline::new(EventBus::default());
        let records = pipeline.run(&[delay], &ctx).await;
        assert_eq!(records[0].outcome, ActionOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_retry_on_failure_retries_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let (ctx, _) = context(Map::new());
        let mut webhook = Action::new(
            ctx.workflow_id,
            ActionKind::Webhook,
            0,
            json!({"url": format!("{}/flaky", server.uri())}),
        );
        webhook.retry_on_failure = true;
        webhook.retry_attempts = 3;
        webhook.retry_delay_ms = 5;

        let pipeline = ActionPipeline::new(EventBus::default());
        let records = pipeline.run(&[webhook], &ctx).await;
        assert_eq!(records[0].outcome, ActionOutcome::Success);
    }

    #[tokio::test]
    async fn test_conditional_dispatches_matching_branch() {
        let (ctx, email) = context(initial_with_extracted(json!({"price": 42})));

        let conditional = Action::new(
            ctx.workflow_id,
            ActionKind::Conditional,
            0,
            json!({
                "condition": {"variable": "extractedData.price", "operator": ">", "value": 40},
                "if_true": {
                    "kind": "notify",
                    "config": {"channel": "email", "recipients": ["ops@example.test"],
                               "template": "price {{extractedData.price}}"}
                },
                "if_false": {"kind": "delay", "config": {"duration_ms": 1}}
            }),
        );

        let pipeline = ActionPipeline::new(EventBus::default());
        let records = pipeline.run(&[conditional], &ctx).await;

        assert_eq!(records[0].outcome, ActionOutcome::Success);
        assert_eq!(email.sent().len(), 1);
        assert_eq!(email.sent()[0].2, "price 42");
    }

    #[tokio::test]
    async fn test_loop_action_iterates_items() {
        let (ctx, email) = context(Map::new());

        let repeat = Action::new(
            ctx.workflow_id,
            ActionKind::Loop,
            0,
            json!({
                "items": ["a", "b", "c"],
                "action": {
                    "kind": "notify",
                    "config": {"channel": "email", "recipients": ["ops@example.test"],
                               "template": "item {{loopItem}}"}
                }
            }),
        );

        let pipeline = ActionPipeline::new(EventBus::default());
        let records = pipeline.run(&[repeat], &ctx).await;

        assert_eq!(records[0].outcome, ActionOutcome::Success);
        let output = records[0].output.clone().expect("output");
        assert_eq!(output["iterations"], 3);
        let bodies: Vec<String> = email.sent().into_iter().map(|s| s.2).collect();
        assert_eq!(bodies, vec!["item a", "item b", "item c"]);
    }

    #[tokio::test]
    async fn test_integration_round_trip() {
        let bus = EventBus::default();
        let (adapters, _) = adapters();
        let ctx = ActionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Map::new(),
            adapters,
            bus.clone(),
        );

        // An external handler answering integration requests
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let EngineEvent::IntegrationExecute { name, reply, .. } = event {
                    reply.send(json!({"integration": name, "ok": true}));
                }
            }
        });

        let action = Action::new(
            ctx.workflow_id,
            ActionKind::Integration,
            0,
            json!({"name": "crm-sync", "config": {"mode": "full"}}),
        );

        let pipeline = ActionPipeline::new(bus);
        let records = pipeline.run(&[action], &ctx).await;
        assert_eq!(records[0].outcome, ActionOutcome::Success);
        let output = records[0].output.clone().expect("output");
        assert_eq!(output["integration"], "crm-sync");
    }
}
