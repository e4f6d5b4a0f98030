//! Lifecycle event bus
//!
//! The bus is a first-class component: every other component depends on
//! it and never on each other directly. Delivery is best-effort broadcast;
//! consumers must treat events as hints, never as the source of truth.
//! Per-run events are published in causal order (start, steps, terminal).

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tracing::trace;
use uuid::Uuid;

use crate::model::{ActionKind, ChangeKind, ChangeSeverity, RunStatus, RunTrigger};

/// Wire shape consumed by the WebSocket fan-out
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// One-shot reply slot carried by integration events
///
/// Cloneable so the event can fan out; only the first responder wins.
#[derive(Clone)]
pub struct IntegrationReply {
    slot: Arc<Mutex<Option<oneshot::Sender<Value>>>>,
}

impl IntegrationReply {
    pub fn channel() -> (Self, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Deliver the integration result; returns false if already answered
    pub fn send(&self, value: Value) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for IntegrationReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let answered = self.slot.lock().is_none();
        f.debug_struct("IntegrationReply")
            .field("answered", &answered)
            .finish()
    }
}

/// Events published by engine components
#[derive(Debug, Clone)]
pub enum EngineEvent {
    WorkflowCreated {
        workflow_id: Uuid,
        name: String,
    },
    WorkflowUpdated {
        workflow_id: Uuid,
    },
    WorkflowDeleted {
        workflow_id: Uuid,
    },
    RunStarted {
        workflow_id: Uuid,
        run_id: Uuid,
        run_number: i64,
        trigger: RunTrigger,
    },
    RunCompleted {
        workflow_id: Uuid,
        run_id: Uuid,
        duration_ms: u64,
    },
    RunFailed {
        workflow_id: Uuid,
        run_id: Uuid,
        status: RunStatus,
        error: String,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
        name: String,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
    },
    StepRetry {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
    },
    ChangeDetected {
        workflow_id: Uuid,
        change_id: Uuid,
        url: String,
        kind: ChangeKind,
        severity: ChangeSeverity,
        change_score: f64,
        /// Structural paths added since the baseline (DOM method only)
        added_paths: Vec<String>,
        /// Changed text, for conditional content triggers
        changed_text: Option<String>,
        /// Last HTTP status observed for the page
        status_code: Option<u16>,
    },
    ActionCompleted {
        run_id: Uuid,
        action_id: Uuid,
        kind: ActionKind,
    },
    ActionFailed {
        run_id: Uuid,
        action_id: Uuid,
        kind: ActionKind,
        error: String,
    },
    RateLimitExceeded {
        workflow_id: Uuid,
        trigger: RunTrigger,
    },
    WebhookRegistered {
        workflow_id: Uuid,
        trigger_id: Uuid,
        url: String,
    },
    IntegrationExecute {
        name: String,
        config: Value,
        context: Value,
        reply: IntegrationReply,
    },
    /// Application-defined events consumed by event triggers
    Custom {
        name: String,
        source: Option<String>,
        payload: Value,
    },
}

impl EngineEvent {
    /// Wire event name (`category:verb`)
    pub fn event_type(&self) -> &str {
        match self {
            EngineEvent::WorkflowCreated { .. } => "workflow:created",
            EngineEvent::WorkflowUpdated { .. } => "workflow:updated",
            EngineEvent::WorkflowDeleted { .. } => "workflow:deleted",
            EngineEvent::RunStarted { .. } => "run:started",
            EngineEvent::RunCompleted { .. } => "run:completed",
            EngineEvent::RunFailed { .. } => "run:failed",
            EngineEvent::StepStarted { .. } => "step:started",
            EngineEvent::StepCompleted { .. } => "step:completed",
            EngineEvent::StepFailed { .. } => "step:failed",
            EngineEvent::StepRetry { .. } => "step:retry",
            EngineEvent::ChangeDetected { .. } => "change:detected",
            EngineEvent::ActionCompleted { .. } => "action:completed",
            EngineEvent::ActionFailed { .. } => "action:failed",
            EngineEvent::RateLimitExceeded { .. } => "rate_limit:exceeded",
            EngineEvent::WebhookRegistered { .. } => "webhook:registered",
            EngineEvent::IntegrationExecute { .. } => "integration:execute",
            EngineEvent::Custom { name, .. } => name,
        }
    }

    /// Event payload for the wire envelope
    pub fn data(&self) -> Value {
        match self {
            EngineEvent::WorkflowCreated { workflow_id, name } => {
                json!({"workflow_id": workflow_id, "name": name})
            }
            EngineEvent::WorkflowUpdated { workflow_id }
            | EngineEvent::WorkflowDeleted { workflow_id } => {
                json!({"workflow_id": workflow_id})
            }
            EngineEvent::RunStarted {
                workflow_id,
                run_id,
                run_number,
                trigger,
            } => json!({
                "workflow_id": workflow_id,
                "run_id": run_id,
                "run_number": run_number,
                "trigger": trigger,
            }),
            EngineEvent::RunCompleted {
                workflow_id,
                run_id,
                duration_ms,
            } => json!({
                "workflow_id": workflow_id,
                "run_id": run_id,
                "duration_ms": duration_ms,
            }),
            EngineEvent::RunFailed {
                workflow_id,
                run_id,
                status,
                error,
            } => json!({
                "workflow_id": workflow_id,
                "run_id": run_id,
                "status": status,
                "error": error,
            }),
            EngineEvent::StepStarted {
                run_id,
                step_id,
                name,
            } => json!({"run_id": run_id, "step_id": step_id, "name": name}),
            EngineEvent::StepCompleted { run_id, step_id } => {
                json!({"run_id": run_id, "step_id": step_id})
            }
            EngineEvent::StepFailed {
                run_id,
                step_id,
                error,
            } => json!({"run_id": run_id, "step_id": step_id, "error": error}),
            EngineEvent::StepRetry {
                run_id,
                step_id,
                attempt,
            } => json!({"run_id": run_id, "step_id": step_id, "attempt": attempt}),
            EngineEvent::ChangeDetected {
                workflow_id,
                change_id,
                url,
                kind,
                severity,
                change_score,
                added_paths,
                changed_text,
                status_code,
            } => json!({
                "workflow_id": workflow_id,
                "change_id": change_id,
                "url": url,
                "kind": kind,
                "severity": severity,
                "change_score": change_score,
                "added_paths": added_paths,
                "changed_text": changed_text,
                "status_code": status_code,
            }),
            EngineEvent::ActionCompleted {
                run_id,
                action_id,
                kind,
            } => json!({"run_id": run_id, "action_id": action_id, "kind": kind}),
            EngineEvent::ActionFailed {
                run_id,
                action_id,
                kind,
                error,
            } => json!({
                "run_id": run_id,
                "action_id": action_id,
                "kind": kind,
                "error": error,
            }),
            EngineEvent::RateLimitExceeded {
                workflow_id,
                trigger,
            } => json!({"workflow_id": workflow_id, "trigger": trigger}),
            EngineEvent::WebhookRegistered {
                workflow_id,
                trigger_id,
                url,
            } => json!({"workflow_id": workflow_id, "trigger_id": trigger_id, "url": url}),
            EngineEvent::IntegrationExecute {
                name,
                config,
                context,
                ..
            } => json!({"name": name, "config": config, "context": context}),
            EngineEvent::Custom {
                name,
                source,
                payload,
            } => json!({"name": name, "source": source, "payload": payload}),
        }
    }

    /// Wrap into the wire envelope, stamping the current instant
    pub fn envelope(&self) -> Envelope {
        Envelope {
            kind: self.event_type().to_string(),
            data: self.data(),
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast bus with bounded capacity
///
/// Slow subscribers lag and lose events rather than blocking publishers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; lost events (no subscribers) are not an error
    pub fn publish(&self, event: EngineEvent) {
        trace!(event_type = event.event_type(), "publishing event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let workflow_id = Uuid::now_v7();
        bus.publish(EngineEvent::WorkflowCreated {
            workflow_id,
            name: "w".to_string(),
        });

        let event = rx.recv().await.expect("should receive event");
        assert_eq!(event.event_type(), "workflow:created");
        assert_eq!(event.data()["name"], "w");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::WorkflowDeleted {
            workflow_id: Uuid::now_v7(),
        });
    }

    #[test]
    fn test_envelope_shape() {
        let event = EngineEvent::RateLimitExceeded {
            workflow_id: Uuid::now_v7(),
            trigger: RunTrigger::Webhook,
        };
        let envelope = event.envelope();
        assert_eq!(envelope.kind, "rate_limit:exceeded");

        let wire = serde_json::to_value(&envelope).expect("should serialize");
        assert_eq!(wire["type"], "rate_limit:exceeded");
        assert!(wire["data"]["workflow_id"].is_string());
        assert!(wire["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_integration_reply_first_responder_wins() {
        let (reply, rx) = IntegrationReply::channel();
        assert!(reply.send(json!({"ok": true})));
        assert!(!reply.send(json!({"ok": false})));

        let value = rx.await.expect("should receive reply");
        assert_eq!(value, json!({"ok": true}));
    }
}
