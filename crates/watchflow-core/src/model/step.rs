//! Playbooks and steps
//!
//! A playbook is the ordered, possibly-branching DAG of steps a workflow
//! executes. Step definitions are persisted with the playbook; step state
//! is materialized per run.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Step kinds dispatched through the executor registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Navigate,
    Wait,
    Click,
    Fill,
    Extract,
    Condition,
    Loop,
    Screenshot,
    Api,
    Store,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Navigate => "navigate",
            StepKind::Wait => "wait",
            StepKind::Click => "click",
            StepKind::Fill => "fill",
            StepKind::Extract => "extract",
            StepKind::Condition => "condition",
            StepKind::Loop => "loop",
            StepKind::Screenshot => "screenshot",
            StepKind::Api => "api",
            StepKind::Store => "store",
        }
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "navigate" => Ok(StepKind::Navigate),
            "wait" => Ok(StepKind::Wait),
            "click" => Ok(StepKind::Click),
            "fill" => Ok(StepKind::Fill),
            "extract" => Ok(StepKind::Extract),
            "condition" => Ok(StepKind::Condition),
            "loop" => Ok(StepKind::Loop),
            "screenshot" => Ok(StepKind::Screenshot),
            "api" => Ok(StepKind::Api),
            "store" => Ok(StepKind::Store),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// A node in the playbook DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Identifier unique within the playbook; referenced by `dependencies`
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: StepKind,
    /// Kind-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,
    /// Sibling step ids that must complete before this step runs
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, kind: StepKind, config: serde_json::Value) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            config,
            dependencies: vec![],
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Step-graph definition referenced by workflows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<StepDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Playbook {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            steps,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-run status of a materialized step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Cancelled | StepStatus::Skipped
        )
    }
}

/// Materialized state of one step inside a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Retries used by the final attempt
    pub retry_count: u32,
    pub dependencies: Vec<String>,
}

impl StepState {
    pub fn from_definition(definition: &StepDefinition) -> Self {
        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            kind: definition.kind,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            retry_count: 0,
            dependencies: definition.dependencies.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_builder() {
        let step = StepDefinition::new("d", StepKind::Extract, serde_json::json!({}))
            .depends_on(&["b", "c"]);
        assert_eq!(step.dependencies, vec!["b", "c"]);
        assert_eq!(step.name, "d");
    }

    #[test]
    fn test_step_kind_round_trip() {
        let kinds = [
            StepKind::Navigate,
            StepKind::Wait,
            StepKind::Click,
            StepKind::Fill,
            StepKind::Extract,
            StepKind::Condition,
            StepKind::Loop,
            StepKind::Screenshot,
            StepKind::Api,
            StepKind::Store,
        ];
        for kind in kinds {
            let parsed: StepKind = kind.as_str().parse().expect("should parse");
            assert_eq!(parsed, kind);
        }
    }
}
