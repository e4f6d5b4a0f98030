//! Actions: the post-run side-effect pipeline

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Action kinds dispatched through the pipeline registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RunPlaybook,
    Notify,
    CreatePr,
    Webhook,
    Export,
    Script,
    Integration,
    Conditional,
    Loop,
    Delay,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::RunPlaybook => "run_playbook",
            ActionKind::Notify => "notify",
            ActionKind::CreatePr => "create_pr",
            ActionKind::Webhook => "webhook",
            ActionKind::Export => "export",
            ActionKind::Script => "script",
            ActionKind::Integration => "integration",
            ActionKind::Conditional => "conditional",
            ActionKind::Loop => "loop",
            ActionKind::Delay => "delay",
        }
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_playbook" => Ok(ActionKind::RunPlaybook),
            "notify" => Ok(ActionKind::Notify),
            "create_pr" => Ok(ActionKind::CreatePr),
            "webhook" => Ok(ActionKind::Webhook),
            "export" => Ok(ActionKind::Export),
            "script" => Ok(ActionKind::Script),
            "integration" => Ok(ActionKind::Integration),
            "conditional" => Ok(ActionKind::Conditional),
            "loop" => Ok(ActionKind::Loop),
            "delay" => Ok(ActionKind::Delay),
            other => Err(format!("unknown action kind: {other}")),
        }
    }
}

/// An ordered step of the post-run pipeline
///
/// Actions execute strictly by `order`, ties broken by insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub kind: ActionKind,
    pub order: i32,
    pub enabled: bool,
    pub retry_on_failure: bool,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// When set, a failed action does not abort the rest of the pipeline
    pub continue_on_error: bool,
    /// Kind-specific configuration; string fields may contain templates
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Action {
    pub fn new(workflow_id: Uuid, kind: ActionKind, order: i32, config: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            kind,
            order,
            enabled: true,
            retry_on_failure: false,
            retry_attempts: 0,
            retry_delay_ms: 1_000,
            continue_on_error: false,
            config,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of one action within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failed,
    Skipped,
}

/// Record of an executed (or skipped) action, stored on the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: Uuid,
    pub kind: ActionKind,
    pub outcome: ActionOutcome,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        let kinds = [
            ActionKind::RunPlaybook,
            ActionKind::Notify,
            ActionKind::CreatePr,
            ActionKind::Webhook,
            ActionKind::Export,
            ActionKind::Script,
            ActionKind::Integration,
            ActionKind::Conditional,
            ActionKind::Loop,
            ActionKind::Delay,
        ];
        for kind in kinds {
            let parsed: ActionKind = kind.as_str().parse().expect("should parse");
            assert_eq!(parsed, kind);
        }
    }
}
