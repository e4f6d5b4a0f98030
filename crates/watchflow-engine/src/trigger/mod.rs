//! Trigger router
//!
//! The fan-in point for anything that wants to start a workflow. The
//! router maintains in-memory indexes for webhook registrations, api-poll
//! timers, event listeners, chain dependents, and conditional change
//! triggers. Every firing consults the workflow's token bucket first;
//! attempts that cannot obtain a slot are dropped and emit a
//! `rate_limit:exceeded` event. The router only produces run requests; it
//! never executes runs itself.

pub mod rate_limit;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use watchflow_core::bus::{EngineEvent, EventBus};
use watchflow_core::model::{
    RateLimitConfig, RunTrigger, Trigger, TriggerConfig, TriggerKind, Workflow,
};
use watchflow_core::template;
use watchflow_storage::Repository;

use crate::detector::dom::SimpleSelector;
use crate::error::{EngineError, Result};
use crate::scheduler::queue::{RunQueue, RunRequest};
use rate_limit::RateLimiter;

type HmacSha256 = Hmac<Sha256>;

/// Signature headers accepted on webhook ingress, in precedence order
const SIGNATURE_HEADERS: [&str; 2] = ["x-webhook-signature", "x-hub-signature"];

/// Router tuning knobs
#[derive(Debug, Clone)]
pub struct TriggerRouterConfig {
    /// Base URL published for webhook registrations
    pub public_url: String,

    /// Request timeout for api-poll calls
    pub poll_timeout: Duration,

    /// Applied when a workflow carries no rate-limit override
    pub default_rate_limit: RateLimitConfig,
}

impl Default for TriggerRouterConfig {
    fn default() -> Self {
        Self {
            public_url: "http://localhost:8080".to_string(),
            poll_timeout: Duration::from_secs(30),
            default_rate_limit: RateLimitConfig::default(),
        }
    }
}

struct WebhookRegistration {
    trigger_id: Uuid,
    workflow_id: Uuid,
    secret: Option<String>,
    hits: AtomicU64,
}

#[derive(Clone)]
struct EventRegistration {
    trigger_id: Uuid,
    workflow_id: Uuid,
    event_name: String,
    source: Option<String>,
}

#[derive(Clone)]
struct ChainRegistration {
    trigger_id: Uuid,
    dependent: Uuid,
}

/// The trigger router component
#[derive(Clone)]
pub struct TriggerRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    queue: Arc<RunQueue>,
    config: TriggerRouterConfig,
    /// token -> registration
    webhooks: DashMap<String, WebhookRegistration>,
    /// trigger id -> token (reverse index for unregister)
    webhook_tokens: DashMap<Uuid, String>,
    /// trigger id -> (workflow, poll task)
    polls: DashMap<Uuid, (Uuid, JoinHandle<()>)>,
    /// trigger id -> event listener
    events: DashMap<Uuid, EventRegistration>,
    /// source workflow -> dependents
    chains: DashMap<Uuid, Vec<ChainRegistration>>,
    /// workflow -> conditional (content/element/status) triggers
    conditionals: DashMap<Uuid, Vec<Trigger>>,
    /// workflow -> token bucket
    limiters: DashMap<Uuid, Arc<RateLimiter>>,
    rate_configs: DashMap<Uuid, RateLimitConfig>,
    http: Client,
    cancel: CancellationToken,
}

impl TriggerRouter {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        queue: Arc<RunQueue>,
        config: TriggerRouterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                repo,
                bus,
                queue,
                config,
                webhooks: DashMap::new(),
                webhook_tokens: DashMap::new(),
                polls: DashMap::new(),
                events: DashMap::new(),
                chains: DashMap::new(),
                conditionals: DashMap::new(),
                limiters: DashMap::new(),
                rate_configs: DashMap::new(),
                http: Client::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the bus listener driving event triggers and conditional
    /// change triggers
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.bus_loop().await });
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        for entry in self.inner.polls.iter() {
            entry.value().1.abort();
        }
        self.inner.polls.clear();
    }

    /// Arm every trigger of the workflow
    pub async fn arm_workflow(&self, workflow: &Workflow) -> Result<()> {
        if let Some(limit) = &workflow.rate_limit {
            self.inner.rate_configs.insert(workflow.id, limit.clone());
            self.inner.limiters.remove(&workflow.id);
        }
        let triggers = self.inner.repo.list_triggers(Some(workflow.id)).await?;
        for trigger in triggers {
            self.register(&trigger).await?;
        }
        Ok(())
    }

    /// Remove every index entry for the workflow; idempotent
    pub fn disarm_workflow(&self, workflow_id: Uuid) {
        self.inner
            .webhooks
            .retain(|_, reg| reg.workflow_id != workflow_id);
        self.inner.webhook_tokens.retain(|trigger_id, _| {
            // Webhook map was the source of truth; drop dangling tokens
            self.inner
                .webhooks
                .iter()
                .any(|e| e.value().trigger_id == *trigger_id)
        });
        self.inner.polls.retain(|_, entry| {
            if entry.0 == workflow_id {
                entry.1.abort();
                false
            } else {
                true
            }
        });
        self.inner
            .events
            .retain(|_, reg| reg.workflow_id != workflow_id);
        for mut entry in self.inner.chains.iter_mut() {
            entry.value_mut().retain(|reg| reg.dependent != workflow_id);
        }
        self.inner.conditionals.remove(&workflow_id);
        self.inner.limiters.remove(&workflow_id);
        debug!(%workflow_id, "disarmed workflow triggers");
    }

    /// Register one trigger, dispatching by kind
    ///
    /// Webhook registration allocates a token when the config carries none
    /// and publishes the external URL on the bus.
    #[instrument(skip(self, trigger), fields(trigger_id = %trigger.id, kind = trigger.kind().as_str()))]
    pub async fn register(&self, trigger: &Trigger) -> Result<Trigger> {
        let mut trigger = trigger.clone();
        match trigger.config.clone() {
            TriggerConfig::Webhook { token, secret } => {
                let token = match token {
                    Some(t) => t,
                    None => {
                        let token = allocate_token();
                        trigger.config = TriggerConfig::Webhook {
                            token: Some(token.clone()),
                            secret: secret.clone(),
                        };
                        trigger = self.inner.repo.update_trigger(trigger).await?;
                        token
                    }
                };
                self.inner.webhooks.insert(
                    token.clone(),
                    WebhookRegistration {
                        trigger_id: trigger.id,
                        workflow_id: trigger.workflow_id,
                        secret,
                        hits: AtomicU64::new(0),
                    },
                );
                self.inner.webhook_tokens.insert(trigger.id, token.clone());
                let url = format!("{}/workflows/webhook/{token}", self.inner.config.public_url);
                info!(url, "webhook registered");
                self.inner.bus.publish(EngineEvent::WebhookRegistered {
                    workflow_id: trigger.workflow_id,
                    trigger_id: trigger.id,
                    url,
                });
            }

            TriggerConfig::ApiPoll { .. } => {
                let handle = self.inner.clone().spawn_poll(trigger.clone());
                if let Some((_, old)) = self
                    .inner
                    .polls
                    .insert(trigger.id, (trigger.workflow_id, handle))
                {
                    old.abort();
                }
            }

            TriggerConfig::Event { event_name, source } => {
                self.inner.events.insert(
                    trigger.id,
                    EventRegistration {
                        trigger_id: trigger.id,
                        workflow_id: trigger.workflow_id,
                        event_name,
                        source,
                    },
                );
            }

            TriggerConfig::Chain { source_workflow } => {
                self.inner
                    .chains
                    .entry(source_workflow)
                    .or_default()
                    .push(ChainRegistration {
                        trigger_id: trigger.id,
                        dependent: trigger.workflow_id,
                    });
            }

            TriggerConfig::Content { .. }
            | TriggerConfig::Element { .. }
            | TriggerConfig::Status { .. } => {
                self.inner
                    .conditionals
                    .entry(trigger.workflow_id)
                    .or_default()
                    .push(trigger.clone());
            }
        }
        Ok(trigger)
    }

    /// Remove one trigger from the indexes; idempotent
    pub fn unregister(&self, trigger: &Trigger) {
        match trigger.kind() {
            TriggerKind::Webhook => {
                if let Some((_, token)) = self.inner.webhook_tokens.remove(&trigger.id) {
                    self.inner.webhooks.remove(&token);
                }
            }
            TriggerKind::ApiPoll => {
                if let Some((_, (_, handle))) = self.inner.polls.remove(&trigger.id) {
                    handle.abort();
                }
            }
            TriggerKind::Event => {
                self.inner.events.remove(&trigger.id);
            }
            TriggerKind::Chain => {
                for mut entry in self.inner.chains.iter_mut() {
                    entry.value_mut().retain(|reg| reg.trigger_id != trigger.id);
                }
            }
            TriggerKind::Content | TriggerKind::Element | TriggerKind::Status => {
                if let Some(mut list) = self.inner.conditionals.get_mut(&trigger.workflow_id) {
                    list.retain(|t| t.id != trigger.id);
                }
            }
        }
    }

    /// Webhook ingress: verify, rate limit, and queue a run
    ///
    /// Returns the workflow id on acceptance.
    #[instrument(skip(self, body, headers))]
    pub async fn handle_webhook(
        &self,
        token: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<Uuid> {
        let (trigger_id, workflow_id, secret) = {
            let registration = self
                .inner
                .webhooks
                .get(token)
                .ok_or(EngineError::InvalidWebhookToken)?;
            registration.hits.fetch_add(1, Ordering::Relaxed);
            (
                registration.trigger_id,
                registration.workflow_id,
                registration.secret.clone(),
            )
        };

        if let Some(secret) = secret {
            let header = SIGNATURE_HEADERS
                .iter()
                .find_map(|name| headers.get(*name))
                .ok_or(EngineError::SignatureMismatch)?;
            if !verify_signature(&secret, body, header) {
                return Err(EngineError::SignatureMismatch);
            }
        }

        let payload: Value = serde_json::from_slice(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));

        if !self
            .fire(workflow_id, Some(trigger_id), RunTrigger::Webhook, Some(payload))
            .await?
        {
            return Err(EngineError::RateLimitExceeded(workflow_id));
        }
        Ok(workflow_id)
    }

    /// Chain fan-out on successful workflow completion
    pub async fn on_workflow_completed(&self, workflow_id: Uuid, result: &Value) {
        let dependents = match self.inner.chains.get(&workflow_id) {
            Some(list) => list.clone(),
            None => return,
        };
        for reg in dependents {
            debug!(source = %workflow_id, dependent = %reg.dependent, "firing chain trigger");
            if let Err(e) = self
                .fire(
                    reg.dependent,
                    Some(reg.trigger_id),
                    RunTrigger::Chain,
                    Some(result.clone()),
                )
                .await
            {
                warn!(dependent = %reg.dependent, error = %e, "chain fire failed");
            }
        }
    }

    /// Fire a workflow through the rate limiter; false means the attempt
    /// was dropped
    pub async fn fire(
        &self,
        workflow_id: Uuid,
        trigger_id: Option<Uuid>,
        kind: RunTrigger,
        data: Option<Value>,
    ) -> Result<bool> {
        self.inner.fire(workflow_id, trigger_id, kind, data).await
    }

    /// Webhook deliveries counted for a token, for stats
    pub fn webhook_hits(&self, token: &str) -> u64 {
        self.inner
            .webhooks
            .get(token)
            .map(|reg| reg.hits.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl RouterInner {
    /// Rate-limit gate plus enqueue; false means the attempt was dropped
    async fn fire(
        &self,
        workflow_id: Uuid,
        trigger_id: Option<Uuid>,
        kind: RunTrigger,
        data: Option<Value>,
    ) -> Result<bool> {
        let limiter = self.limiter_for(workflow_id);
        if !limiter.try_acquire() {
            self.bus.publish(EngineEvent::RateLimitExceeded {
                workflow_id,
                trigger: kind,
            });
            debug!(%workflow_id, trigger = kind.as_str(), "trigger dropped by rate limit");
            return Ok(false);
        }

        if let Some(trigger_id) = trigger_id {
            // Usage counters are best-effort
            if let Ok(mut trigger) = self.repo.get_trigger(trigger_id).await {
                trigger.trigger_count += 1;
                trigger.last_triggered = Some(Utc::now());
                if let Err(e) = self.repo.update_trigger(trigger).await {
                    warn!(%trigger_id, error = %e, "failed to update trigger stats");
                }
            }
        }

        let mut request = RunRequest::new(workflow_id, kind);
        if let Some(trigger_id) = trigger_id {
            request = request.with_triggered_by(trigger_id.to_string());
        }
        if let Some(data) = data {
            request = request.with_data(data);
        }
        self.queue.enqueue(request);
        Ok(true)
    }

    fn limiter_for(&self, workflow_id: Uuid) -> Arc<RateLimiter> {
        self.limiters
            .entry(workflow_id)
            .or_insert_with(|| {
                let config = self
                    .rate_configs
                    .get(&workflow_id)
                    .map(|c| c.clone())
                    .unwrap_or_else(|| self.config.default_rate_limit.clone());
                Arc::new(RateLimiter::from_config(&config))
            })
            .clone()
    }

    async fn bus_loop(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(EngineEvent::Custom {
                    name,
                    source,
                    payload,
                }) => self.handle_custom_event(&name, source.as_deref(), payload).await,
                Ok(EngineEvent::ChangeDetected {
                    workflow_id,
                    change_score,
                    added_paths,
                    changed_text,
                    status_code,
                    ..
                }) => {
                    self.handle_change_event(
                        workflow_id,
                        change_score,
                        &added_paths,
                        changed_text.as_deref(),
                        status_code,
                    )
                    .await
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "trigger router lagged behind the bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_custom_event(&self, name: &str, source: Option<&str>, payload: Value) {
        let matches: Vec<EventRegistration> = self
            .events
            .iter()
            .filter(|entry| {
                let reg = entry.value();
                reg.event_name == name
                    && reg
                        .source
                        .as_deref()
                        .map(|want| Some(want) == source)
                        .unwrap_or(true)
            })
            .map(|entry| entry.value().clone())
            .collect();

        for reg in matches {
            if let Err(e) = self
                .fire(
                    reg.workflow_id,
                    Some(reg.trigger_id),
                    RunTrigger::Event,
                    Some(payload.clone()),
                )
                .await
            {
                warn!(workflow_id = %reg.workflow_id, error = %e, "event fire failed");
            }
        }
    }

    async fn handle_change_event(
        &self,
        workflow_id: Uuid,
        change_score: f64,
        added_paths: &[String],
        changed_text: Option<&str>,
        status_code: Option<u16>,
    ) {
        let triggers = match self.conditionals.get(&workflow_id) {
            Some(list) => list.clone(),
            None => return,
        };

        for trigger in triggers {
            let (fire, kind) = match &trigger.config {
                TriggerConfig::Content {
                    pattern, threshold, ..
                } => {
                    let by_pattern = pattern.as_ref().and_then(|p| Regex::new(p).ok()).map(|re| {
                        changed_text.map(|t| re.is_match(t)).unwrap_or(false)
                    });
                    let fire = match (by_pattern, threshold) {
                        (Some(true), _) => true,
                        (Some(false), Some(th)) => change_score > *th,
                        (Some(false), None) => false,
                        (None, Some(th)) => change_score > *th,
                        (None, None) => true,
                    };
                    (fire, RunTrigger::Content)
                }
                TriggerConfig::Element { selector } => {
                    let sel = SimpleSelector::parse(selector);
                    let fire = added_paths.iter().any(|path| {
                        path.split('/').any(|segment| sel.matches_path_segment(segment))
                    });
                    (fire, RunTrigger::Element)
                }
                TriggerConfig::Status {
                    status_code: want,
                    pattern,
                } => {
                    let fire = match status_code {
                        Some(code) => {
                            want.map(|w| w == code).unwrap_or(false)
                                || pattern
                                    .as_ref()
                                    .and_then(|p| Regex::new(p).ok())
                                    .map(|re| re.is_match(&code.to_string()))
                                    .unwrap_or(false)
                        }
                        None => false,
                    };
                    (fire, RunTrigger::Status)
                }
                _ => (false, RunTrigger::Content),
            };

            if fire {
                if let Err(e) = self
                    .fire(
                        workflow_id,
                        Some(trigger.id),
                        kind,
                        Some(json!({
                            "change_score": change_score,
                            "changed_text": changed_text,
                            "added_paths": added_paths,
                            "status_code": status_code,
                        })),
                    )
                    .await
                {
                    warn!(%workflow_id, error = %e, "conditional fire failed");
                }
            }
        }
    }

    fn spawn_poll(self: Arc<Self>, trigger: Trigger) -> JoinHandle<()> {
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let TriggerConfig::ApiPoll {
                endpoint,
                method,
                headers,
                interval_ms,
                compare_field,
                ..
            } = trigger.config.clone()
            else {
                return;
            };

            let period = Duration::from_millis(interval_ms.max(100));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self
                    .poll_once(&trigger, &endpoint, method.as_deref(), &headers, compare_field.as_deref())
                    .await
                {
                    warn!(trigger_id = %trigger.id, error = %e, "api poll failed");
                }
            }
        })
    }

    async fn poll_once(
        &self,
        trigger: &Trigger,
        endpoint: &str,
        method: Option<&str>,
        headers: &HashMap<String, String>,
        compare_field: Option<&str>,
    ) -> Result<()> {
        let method = method
            .unwrap_or("GET")
            .parse::<reqwest::Method>()
            .map_err(|_| EngineError::validation(format!("bad poll method for {}", trigger.id)))?;

        let mut request = self
            .http
            .request(method, endpoint)
            .timeout(self.config.poll_timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::external(e.to_string()))?;
        let body_text = response
            .text()
            .await
            .map_err(|e| EngineError::external(e.to_string()))?;
        let body: Value =
            serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));

        let observed = match compare_field {
            Some(path) => template::resolve_path(&body, path)
                .cloned()
                .unwrap_or(Value::Null),
            None => body.clone(),
        };

        // Compare against the durably stored previous response
        let mut row = self.repo.get_trigger(trigger.id).await?;
        let TriggerConfig::ApiPoll {
            last_response,
            endpoint: ep,
            method: m,
            headers: h,
            interval_ms,
            compare_field: cf,
        } = row.config.clone()
        else {
            return Ok(());
        };

        if last_response.as_ref() == Some(&observed) {
            return Ok(());
        }

        row.config = TriggerConfig::ApiPoll {
            endpoint: ep,
            method: m,
            headers: h,
            interval_ms,
            compare_field: cf,
            last_response: Some(observed.clone()),
        };
        self.repo.update_trigger(row).await?;

        // First observation just seeds the stored response
        if last_response.is_none() {
            return Ok(());
        }

        self.fire(
            trigger.workflow_id,
            Some(trigger.id),
            RunTrigger::ApiPoll,
            Some(json!({ "response": body, "observed": observed })),
        )
        .await?;
        Ok(())
    }
}

fn allocate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time HMAC-SHA-256 verification of `sha256=<hex>` headers
fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature header value for a body (used by tests and docs)
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchflow_storage::InMemoryRepository;

    struct Fixture {
        router: TriggerRouter,
        repo: Arc<InMemoryRepository>,
        bus: EventBus,
        queue: Arc<RunQueue>,
    }

    fn fixture() -> Fixture {
        let bus = EventBus::default();
        let repo = Arc::new(InMemoryRepository::new(bus.clone()));
        let queue = Arc::new(RunQueue::new());
        let router = TriggerRouter::new(
            repo.clone(),
            bus.clone(),
            queue.clone(),
            TriggerRouterConfig::default(),
        );
        Fixture {
            router,
            repo,
            bus,
            queue,
        }
    }

    async fn seed_workflow(repo: &InMemoryRepository) -> Workflow {
        repo.create_workflow(Workflow::new("w"))
            .await
            .expect("should create workflow")
    }

    #[tokio::test]
    async fn test_webhook_token_allocated_and_published() {
        let f = fixture();
        let mut rx = f.bus.subscribe();
        let workflow = seed_workflow(&f.repo).await;
        let trigger = f
            .repo
            .create_trigger(Trigger::new(
                workflow.id,
                TriggerConfig::Webhook {
                    token: None,
                    secret: None,
                },
            ))
            .await
            .expect("create trigger");

        let registered = f.router.register(&trigger).await.expect("register");
        let TriggerConfig::Webhook { token, .. } = &registered.config else {
            panic!("webhook config expected");
        };
        let token = token.clone().expect("token allocated");
        assert_eq!(token.len(), 32);

        // The allocation was persisted
        let stored = f.repo.get_trigger(trigger.id).await.expect("get");
        let TriggerConfig::Webhook { token: stored_token, .. } = stored.config else {
            panic!("webhook config expected");
        };
        assert_eq!(stored_token.as_deref(), Some(token.as_str()));

        // And announced with the external URL
        let mut saw_url = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::WebhookRegistered { url, .. } = event {
                assert!(url.ends_with(&format!("/workflows/webhook/{token}")));
                saw_url = true;
            }
        }
        assert!(saw_url);
    }

    #[tokio::test]
    async fn test_webhook_signature_verification() {
        let f = fixture();
        let workflow = seed_workflow(&f.repo).await;
        let trigger = f
            .repo
            .create_trigger(Trigger::new(
                workflow.id,
                TriggerConfig::Webhook {
                    token: Some("tok-1".to_string()),
                    secret: Some("s3cr3t".to_string()),
                },
            ))
            .await
            .expect("create trigger");
        f.router.register(&trigger).await.expect("register");

        let body = br#"{"x":1}"#;
        let mut headers = HashMap::new();
        headers.insert(
            "x-webhook-signature".to_string(),
            sign_body("s3cr3t", body),
        );

        let accepted = f
            .router
            .handle_webhook("tok-1", body, &headers)
            .await
            .expect("valid signature accepted");
        assert_eq!(accepted, workflow.id);
        assert_eq!(f.queue.queued_len(), 1);

        // Wrong signature
        let mut bad = HashMap::new();
        bad.insert(
            "x-webhook-signature".to_string(),
            "sha256=deadbeef".to_string(),
        );
        let err = f
            .router
            .handle_webhook("tok-1", body, &bad)
            .await
            .expect_err("bad signature rejected");
        assert!(matches!(err, EngineError::SignatureMismatch));

        // Missing signature
        let err = f
            .router
            .handle_webhook("tok-1", body, &HashMap::new())
            .await
            .expect_err("missing signature rejected");
        assert!(matches!(err, EngineError::SignatureMismatch));

        // Unknown token
        let err = f
            .router
            .handle_webhook("nope", body, &headers)
            .await
            .expect_err("unknown token rejected");
        assert!(matches!(err, EngineError::InvalidWebhookToken));
    }

    #[tokio::test]
    async fn test_rate_limit_drops_and_emits() {
        let f = fixture();
        let mut workflow = Workflow::new("limited");
        workflow.rate_limit = Some(RateLimitConfig {
            capacity: 3,
            window_ms: 60_000,
        });
        let workflow = f.repo.create_workflow(workflow).await.expect("create");
        f.router.arm_workflow(&workflow).await.expect("arm");

        let mut rx = f.bus.subscribe();
        let mut fired = 0;
        for _ in 0..10 {
            if f
                .router
                .fire(workflow.id, None, RunTrigger::Event, None)
                .await
                .expect("fire")
            {
                fired += 1;
            }
        }
        assert_eq!(fired, 3);

        let mut dropped = 0;
        while let Ok(event) = rx.try_recv() {
            if event.event_type() == "rate_limit:exceeded" {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 7);
    }

    #[tokio::test]
    async fn test_chain_fans_out_to_dependents() {
        let f = fixture();
        let source = seed_workflow(&f.repo).await;
        let dep_b = seed_workflow(&f.repo).await;
        let dep_c = seed_workflow(&f.repo).await;

        for dep in [dep_b.id, dep_c.id] {
            let trigger = f
                .repo
                .create_trigger(Trigger::new(
                    dep,
                    TriggerConfig::Chain {
                        source_workflow: source.id,
                    },
                ))
                .await
                .expect("create trigger");
            f.router.register(&trigger).await.expect("register");
        }

        f.router
            .on_workflow_completed(source.id, &json!({"title": "A"}))
            .await;

        assert_eq!(f.queue.queued_len(), 2);
        let first = f.queue.pop_ready(10).expect("pop");
        assert_eq!(first.trigger, RunTrigger::Chain);
        assert_eq!(first.data, Some(json!({"title": "A"})));
    }

    #[tokio::test]
    async fn test_event_trigger_fires_on_custom_event() {
        let f = fixture();
        f.router.start();
        let workflow = seed_workflow(&f.repo).await;
        let trigger = f
            .repo
            .create_trigger(Trigger::new(
                workflow.id,
                TriggerConfig::Event {
                    event_name: "deploy:finished".to_string(),
                    source: Some("ci".to_string()),
                },
            ))
            .await
            .expect("create trigger");
        f.router.register(&trigger).await.expect("register");

        // Wrong source is filtered
        f.bus.publish(EngineEvent::Custom {
            name: "deploy:finished".to_string(),
            source: Some("human".to_string()),
            payload: json!({}),
        });
        // Matching source fires
        f.bus.publish(EngineEvent::Custom {
            name: "deploy:finished".to_string(),
            source: Some("ci".to_string()),
            payload: json!({"build": 7}),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.queue.queued_len(), 1);
        let request = f.queue.pop_ready(10).expect("pop");
        assert_eq!(request.trigger, RunTrigger::Event);
        f.router.shutdown();
    }

    #[tokio::test]
    async fn test_conditional_content_trigger_on_change() {
        let f = fixture();
        f.router.start();
        let workflow = seed_workflow(&f.repo).await;
        let trigger = f
            .repo
            .create_trigger(Trigger::new(
                workflow.id,
                TriggerConfig::Content {
                    selector: None,
                    pattern: Some("sale".to_string()),
                    threshold: None,
                },
            ))
            .await
            .expect("create trigger");
        f.router.register(&trigger).await.expect("register");

        f.bus.publish(EngineEvent::ChangeDetected {
            workflow_id: workflow.id,
            change_id: Uuid::now_v7(),
            url: "https://shop.test".to_string(),
            kind: watchflow_core::model::ChangeKind::Content,
            severity: watchflow_core::model::ChangeSeverity::Medium,
            change_score: 20.0,
            added_paths: vec![],
            changed_text: Some("big sale today".to_string()),
            status_code: Some(200),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.queue.queued_len(), 1);
        let request = f.queue.pop_ready(10).expect("pop");
        assert_eq!(request.trigger, RunTrigger::Content);
        f.router.shutdown();
    }

    #[tokio::test]
    async fn test_conditional_element_trigger_matches_added_path() {
        let f = fixture();
        f.router.start();
        let workflow = seed_workflow(&f.repo).await;
        let trigger = f
            .repo
            .create_trigger(Trigger::new(
                workflow.id,
                TriggerConfig::Element {
                    selector: "p".to_string(),
                },
            ))
            .await
            .expect("create trigger");
        f.router.register(&trigger).await.expect("register");

        f.bus.publish(EngineEvent::ChangeDetected {
            workflow_id: workflow.id,
            change_id: Uuid::now_v7(),
            url: "https://page.test".to_string(),
            kind: watchflow_core::model::ChangeKind::Structure,
            severity: watchflow_core::model::ChangeSeverity::High,
            change_score: 40.0,
            added_paths: vec!["body/p[0]".to_string()],
            changed_text: None,
            status_code: Some(200),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.queue.queued_len(), 1);
        assert_eq!(
            f.queue.pop_ready(10).expect("pop").trigger,
            RunTrigger::Element
        );
        f.router.shutdown();
    }

    #[tokio::test]
    async fn test_disarm_removes_all_indexes() {
        let f = fixture();
        let workflow = seed_workflow(&f.repo).await;
        let trigger = f
            .repo
            .create_trigger(Trigger::new(
                workflow.id,
                TriggerConfig::Webhook {
                    token: Some("tok-2".to_string()),
                    secret: None,
                },
            ))
            .await
            .expect("create trigger");
        f.router.register(&trigger).await.expect("register");

        f.router.disarm_workflow(workflow.id);
        let err = f
            .router
            .handle_webhook("tok-2", b"{}", &HashMap::new())
            .await
            .expect_err("disarmed");
        assert!(matches!(err, EngineError::InvalidWebhookToken));
    }

    #[tokio::test]
    async fn test_api_poll_fires_on_response_change() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "1.0"})))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "2.0"})))
            .mount(&server)
            .await;

        let f = fixture();
        let workflow = seed_workflow(&f.repo).await;
        let trigger = f
            .repo
            .create_trigger(Trigger::new(
                workflow.id,
                TriggerConfig::ApiPoll {
                    endpoint: format!("{}/status", server.uri()),
                    method: None,
                    headers: HashMap::new(),
                    interval_ms: 50,
                    compare_field: Some("version".to_string()),
                    last_response: None,
                },
            ))
            .await
            .expect("create trigger");
        f.router.register(&trigger).await.expect("register");

        // First poll seeds the baseline, second is unchanged, third differs
        tokio::time::sleep(Duration::from_millis(400)).await;
        f.router.shutdown();

        assert_eq!(f.queue.queued_len(), 1);
        let request = f.queue.pop_ready(10).expect("pop");
        assert_eq!(request.trigger, RunTrigger::ApiPoll);
        let data = request.data.expect("poll data");
        assert_eq!(data["observed"], "2.0");

        // The new observation was persisted
        let stored = f.repo.get_trigger(trigger.id).await.expect("get");
        let TriggerConfig::ApiPoll { last_response, .. } = stored.config else {
            panic!("api poll config expected");
        };
        assert_eq!(last_response, Some(json!("2.0")));
    }

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"x":1}"#;
        let header = sign_body("secret", body);
        assert!(verify_signature("secret", body, &header));
        assert!(!verify_signature("other", body, &header));
        assert!(!verify_signature("secret", b"tampered", &header));
        assert!(!verify_signature("secret", body, "sha256=zz"));
        assert!(!verify_signature("secret", body, "md5=abc"));
    }
}
