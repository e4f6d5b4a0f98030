//! Triggers: arming conditions that can start a run

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trigger kinds routed by the trigger router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Webhook,
    ApiPoll,
    Event,
    Content,
    Element,
    Status,
    Chain,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Webhook => "webhook",
            TriggerKind::ApiPoll => "api_poll",
            TriggerKind::Event => "event",
            TriggerKind::Content => "content",
            TriggerKind::Element => "element",
            TriggerKind::Status => "status",
            TriggerKind::Chain => "chain",
        }
    }

    /// True for kinds evaluated against the change detector's result stream
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            TriggerKind::Content | TriggerKind::Element | TriggerKind::Status
        )
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(TriggerKind::Webhook),
            "api_poll" => Ok(TriggerKind::ApiPoll),
            "event" => Ok(TriggerKind::Event),
            "content" => Ok(TriggerKind::Content),
            "element" => Ok(TriggerKind::Element),
            "status" => Ok(TriggerKind::Status),
            "chain" => Ok(TriggerKind::Chain),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

/// Kind-specific trigger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// External HTTP ingress; token allocated at registration when absent
    Webhook {
        #[serde(default)]
        token: Option<String>,
        /// When set, requests must carry a valid HMAC-SHA256 signature
        #[serde(default)]
        secret: Option<String>,
    },

    /// Periodic poll of an HTTP endpoint, firing on response change
    ApiPoll {
        endpoint: String,
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        interval_ms: u64,
        /// Dotted path compared instead of the whole body when set
        #[serde(default)]
        compare_field: Option<String>,
        #[serde(default)]
        last_response: Option<serde_json::Value>,
    },

    /// Fires on a named internal event, optionally filtered by source
    Event {
        event_name: String,
        #[serde(default)]
        source: Option<String>,
    },

    /// Fires when changed text matches, or the change score exceeds a threshold
    Content {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        threshold: Option<f64>,
    },

    /// Fires when the configured selector appears among added paths
    Element { selector: String },

    /// Fires when the page status equals or matches the configured value
    Status {
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        pattern: Option<String>,
    },

    /// Fires when the source workflow completes successfully
    Chain { source_workflow: Uuid },
}

impl TriggerConfig {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerConfig::Webhook { .. } => TriggerKind::Webhook,
            TriggerConfig::ApiPoll { .. } => TriggerKind::ApiPoll,
            TriggerConfig::Event { .. } => TriggerKind::Event,
            TriggerConfig::Content { .. } => TriggerKind::Content,
            TriggerConfig::Element { .. } => TriggerKind::Element,
            TriggerConfig::Status { .. } => TriggerKind::Status,
            TriggerConfig::Chain { .. } => TriggerKind::Chain,
        }
    }
}

/// An arming condition referencing exactly one workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub config: TriggerConfig,
    /// Maintained by the router
    pub trigger_count: u64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(workflow_id: Uuid, config: TriggerConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            config,
            trigger_count: 0,
            last_triggered: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> TriggerKind {
        self.config.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_tagged_serialization() {
        let config = TriggerConfig::Webhook {
            token: Some("tok".to_string()),
            secret: None,
        };
        let json = serde_json::to_value(&config).expect("should serialize");
        assert_eq!(json["kind"], "webhook");
        assert_eq!(json["token"], "tok");

        let parsed: TriggerConfig = serde_json::from_value(json).expect("should deserialize");
        assert_eq!(parsed.kind(), TriggerKind::Webhook);
    }

    #[test]
    fn test_conditional_kinds() {
        assert!(TriggerKind::Content.is_conditional());
        assert!(TriggerKind::Element.is_conditional());
        assert!(TriggerKind::Status.is_conditional());
        assert!(!TriggerKind::Webhook.is_conditional());
        assert!(!TriggerKind::Chain.is_conditional());
    }
}
