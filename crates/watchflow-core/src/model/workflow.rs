//! Workflow: the watched unit
//!
//! A workflow ties together a schedule, triggers, change-detection config,
//! a playbook reference, and the post-run action pipeline.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::change::CaptureMethod;

/// Lifecycle status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Scheduled and armed
    Active,
    /// No scheduler entry, no armed triggers
    Paused,
    /// Scheduling cannot proceed (e.g. persistently invalid spec)
    Error,
    /// Not yet activated
    Draft,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Error => "error",
            WorkflowStatus::Draft => "draft",
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkflowStatus::Active),
            "paused" => Ok(WorkflowStatus::Paused),
            "error" => Ok(WorkflowStatus::Error),
            "draft" => Ok(WorkflowStatus::Draft),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// Kind of schedule spec attached to a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// iCalendar RRULE, e.g. `FREQ=DAILY;BYHOUR=7;BYMINUTE=0`
    Rrule,
    /// 5-field POSIX cron
    Cron,
    /// Fixed period in milliseconds
    Interval,
    /// One-shot at an RFC 3339 instant
    Once,
    /// No schedule (trigger-only workflow)
    None,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Rrule => "rrule",
            ScheduleKind::Cron => "cron",
            ScheduleKind::Interval => "interval",
            ScheduleKind::Once => "once",
            ScheduleKind::None => "none",
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rrule" => Ok(ScheduleKind::Rrule),
            "cron" => Ok(ScheduleKind::Cron),
            "interval" => Ok(ScheduleKind::Interval),
            "once" => Ok(ScheduleKind::Once),
            "none" => Ok(ScheduleKind::None),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

/// Per-run execution limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Wall-clock deadline for a whole run, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Per-step retry attempts (retries, not counting the initial attempt)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay between retries; doubles per attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Independent steps executed concurrently inside a run
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_concurrent_steps() -> usize {
    1
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_concurrent_steps: default_max_concurrent_steps(),
        }
    }
}

/// Per-workflow trigger rate limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Triggers allowed per window
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,

    /// Window length in milliseconds
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
}

fn default_rate_capacity() -> u32 {
    100
}

fn default_rate_window_ms() -> u64 {
    60_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            window_ms: default_rate_window_ms(),
        }
    }
}

/// Change-detection settings for a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDetectionConfig {
    /// Capture method used for snapshots
    #[serde(default)]
    pub method: CaptureMethod,

    /// URLs monitored for this workflow
    pub urls: Vec<String>,

    /// Similarity threshold; below it a change is reported
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// How often the detector loop re-captures, in milliseconds
    #[serde(default = "default_check_interval_ms")]
    pub interval_ms: u64,

    /// Elements matching these selectors are skipped entirely
    #[serde(default)]
    pub ignore_selectors: Vec<String>,

    /// Regexes elided from text content before comparison
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Attributes compared in DOM mode; `None` uses the built-in allowlist
    #[serde(default)]
    pub attribute_allowlist: Option<Vec<String>>,
}

fn default_threshold() -> f64 {
    90.0
}

fn default_check_interval_ms() -> u64 {
    300_000
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        Self {
            method: CaptureMethod::default(),
            urls: vec![],
            threshold: default_threshold(),
            interval_ms: default_check_interval_ms(),
            ignore_selectors: vec![],
            ignore_patterns: vec![],
            attribute_allowlist: None,
        }
    }
}

/// Monotone run counters and aggregates, reset only explicitly
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    /// Incremental mean over terminal runs, in milliseconds
    pub average_duration_ms: f64,
    pub changes_detected: u64,
    pub last_duration_ms: Option<u64>,
}

impl WorkflowMetrics {
    /// Fold one terminal run into the aggregates
    pub fn record_run(&mut self, success: bool, duration_ms: u64) {
        self.total_runs += 1;
        if success {
            self.successful_runs += 1;
        } else {
            self.failed_runs += 1;
        }
        let n = self.total_runs as f64;
        self.average_duration_ms += (duration_ms as f64 - self.average_duration_ms) / n;
        self.last_duration_ms = Some(duration_ms);
    }

    pub fn record_change(&mut self) {
        self.changes_detected += 1;
    }
}

/// The watched unit: a persistent browser-driven task definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub schedule_kind: ScheduleKind,
    /// Opaque spec string, interpreted per `schedule_kind`
    pub schedule_spec: Option<String>,
    /// IANA timezone name; schedules fire in this zone
    pub timezone: String,
    pub change_detection_enabled: bool,
    pub change_detection: Option<ChangeDetectionConfig>,
    /// Reference to the step-graph definition this workflow executes
    pub playbook_id: Option<Uuid>,
    pub execution: ExecutionConfig,
    /// `None` uses the engine default (100 per 60s)
    pub rate_limit: Option<RateLimitConfig>,
    pub metrics: WorkflowMetrics,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// New draft workflow with default limits
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            status: WorkflowStatus::Draft,
            schedule_kind: ScheduleKind::None,
            schedule_spec: None,
            timezone: "UTC".to_string(),
            change_detection_enabled: false,
            change_detection: None,
            playbook_id: None,
            execution: ExecutionConfig::default(),
            rate_limit: None,
            metrics: WorkflowMetrics::default(),
            last_run: None,
            next_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_incremental_mean() {
        let mut metrics = WorkflowMetrics::default();
        metrics.record_run(true, 100);
        metrics.record_run(false, 300);

        assert_eq!(metrics.total_runs, 2);
        assert_eq!(metrics.successful_runs, 1);
        assert_eq!(metrics.failed_runs, 1);
        assert!((metrics.average_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(metrics.last_duration_ms, Some(300));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            WorkflowStatus::Active,
            WorkflowStatus::Paused,
            WorkflowStatus::Error,
            WorkflowStatus::Draft,
        ] {
            let parsed: WorkflowStatus = status.as_str().parse().expect("should parse");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_execution_config_defaults() {
        let config: ExecutionConfig = serde_json::from_str("{}").expect("should deserialize");
        assert_eq!(config.timeout_ms, 300_000);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.max_concurrent_steps, 1);
    }
}
