//! Runs: one execution of a workflow's playbook

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action::ActionRecord;
use super::step::StepState;

/// Run lifecycle status; terminal states are immutable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Timeout => "timeout",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "timeout" => Ok(RunStatus::Timeout),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Schedule,
    Manual,
    Webhook,
    ApiPoll,
    Event,
    Content,
    Element,
    Status,
    Chain,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Schedule => "schedule",
            RunTrigger::Manual => "manual",
            RunTrigger::Webhook => "webhook",
            RunTrigger::ApiPoll => "api_poll",
            RunTrigger::Event => "event",
            RunTrigger::Content => "content",
            RunTrigger::Element => "element",
            RunTrigger::Status => "status",
            RunTrigger::Chain => "chain",
        }
    }
}

impl FromStr for RunTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(RunTrigger::Schedule),
            "manual" => Ok(RunTrigger::Manual),
            "webhook" => Ok(RunTrigger::Webhook),
            "api_poll" => Ok(RunTrigger::ApiPoll),
            "event" => Ok(RunTrigger::Event),
            "content" => Ok(RunTrigger::Content),
            "element" => Ok(RunTrigger::Element),
            "status" => Ok(RunTrigger::Status),
            "chain" => Ok(RunTrigger::Chain),
            other => Err(format!("unknown run trigger: {other}")),
        }
    }
}

/// One execution of a workflow
///
/// `run_number` is assigned atomically at creation and is strictly
/// monotonic per workflow. At most one run per workflow is non-terminal
/// at any instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub run_number: i64,
    pub status: RunStatus,
    pub trigger: RunTrigger,
    /// Free-form originator: trigger id, schedule id, user, source workflow
    pub triggered_by: Option<String>,
    /// Input payload handed to the run by its trigger
    pub input: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Data gathered by extract steps, fed to the action pipeline
    pub extracted_data: serde_json::Value,
    /// Terminal state of every materialized step, keyed by step id
    pub step_results: HashMap<String, StepState>,
    /// Outcome of each pipeline action, in execution order
    pub actions_executed: Vec<ActionRecord>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(workflow_id: Uuid, run_number: i64, trigger: RunTrigger) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            run_number,
            status: RunStatus::Pending,
            trigger,
            triggered_by: None,
            input: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            extracted_data: serde_json::Value::Object(Default::default()),
            step_results: HashMap::new(),
            actions_executed: Vec::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Close the run: stamp completion time and duration
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_finish_stamps_duration() {
        let mut run = Run::new(Uuid::now_v7(), 1, RunTrigger::Manual);
        run.started_at = Some(Utc::now() - chrono::Duration::milliseconds(250));
        run.finish(RunStatus::Success, None);

        assert_eq!(run.status, RunStatus::Success);
        let completed = run.completed_at.expect("should stamp completed_at");
        let started = run.started_at.expect("started_at set above");
        assert!(completed >= started);
        assert!(run.duration_ms.expect("should stamp duration") >= 250);
    }
}
