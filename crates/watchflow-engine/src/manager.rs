//! Manager: the single public entry point
//!
//! Owns the event bus and every component, wires the run-request loop,
//! and drives the full run lifecycle: single-flight admission, step
//! execution, the action pipeline, metrics, and chain fan-out. At boot it
//! marks runs crashed mid-flight as failed and rebuilds scheduler and
//! trigger state from storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use watchflow_core::browser::Browser;
use watchflow_core::bus::{EngineEvent, EventBus};
use watchflow_core::model::{
    Action, ActionKind, ChangeDetectionConfig, ExecutionConfig, Playbook, RateLimitConfig, Run,
    RunStatus, RunTrigger, ScheduleKind, StepDefinition, Trigger, TriggerConfig, Workflow,
    WorkflowStatus,
};
use watchflow_core::retry::BackoffPolicy;
use watchflow_storage::{ChangeFilter, NewRun, Repository, RunFilter};

use crate::actions::{ActionContext, ActionPipeline, OutboundAdapters};
use crate::detector::ChangeDetector;
use crate::error::{EngineError, Result};
use crate::executor::context::ExecutionContext;
use crate::executor::StepExecutor;
use crate::scheduler::conflict::ScheduleConflict;
use crate::scheduler::queue::{RunQueue, RunRequest};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::trigger::{TriggerRouter, TriggerRouterConfig};

/// Bounded attempts for run-number conflicts
const CREATE_RUN_ATTEMPTS: u32 = 3;

/// Default retention for cleanup operations
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Manager configuration
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub scheduler: SchedulerConfig,
    pub router: TriggerRouterConfig,
}

/// Input for creating a workflow
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub status: Option<WorkflowStatus>,
    #[serde(default)]
    pub schedule_kind: Option<ScheduleKind>,
    #[serde(default)]
    pub schedule_spec: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub change_detection: Option<ChangeDetectionConfig>,
    /// Inline playbook; persisted and referenced by the workflow
    #[serde(default)]
    pub playbook: Option<Vec<StepDefinition>>,
    #[serde(default)]
    pub playbook_id: Option<Uuid>,
    #[serde(default)]
    pub execution: Option<ExecutionConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Input for one pipeline action
#[derive(Debug, Clone, Deserialize)]
pub struct ActionSpec {
    pub kind: ActionKind,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub retry_on_failure: bool,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_true() -> bool {
    true
}

fn default_retry_delay() -> u64 {
    1_000
}

/// Partial update for a workflow
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<WorkflowStatus>,
    #[serde(default)]
    pub schedule_kind: Option<ScheduleKind>,
    #[serde(default)]
    pub schedule_spec: Option<Option<String>>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub change_detection_enabled: Option<bool>,
    #[serde(default)]
    pub change_detection: Option<ChangeDetectionConfig>,
    #[serde(default)]
    pub playbook_id: Option<Uuid>,
    #[serde(default)]
    pub execution: Option<ExecutionConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// The orchestration entry point
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    scheduler: Scheduler,
    router: TriggerRouter,
    detector: Arc<ChangeDetector>,
    executor: StepExecutor,
    pipeline: ActionPipeline,
    browser: Arc<dyn Browser>,
    adapters: OutboundAdapters,
    detector_loops: DashMap<Uuid, CancellationToken>,
    run_cancels: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
    dispatch_rx: Mutex<Option<mpsc::Receiver<RunRequest>>>,
}

impl Manager {
    pub fn new(
        repo: Arc<dyn Repository>,
        browser: Arc<dyn Browser>,
        adapters: OutboundAdapters,
        bus: EventBus,
        config: ManagerConfig,
    ) -> Self {
        let queue = Arc::new(RunQueue::new());
        let (scheduler, dispatch_rx) =
            Scheduler::new(repo.clone(), queue.clone(), config.scheduler);
        let router = TriggerRouter::new(repo.clone(), bus.clone(), queue, config.router);
        let detector = Arc::new(ChangeDetector::new(
            repo.clone(),
            browser.clone(),
            bus.clone(),
        ));
        let executor = StepExecutor::new(bus.clone());
        let pipeline = ActionPipeline::new(bus.clone());

        Self {
            inner: Arc::new(ManagerInner {
                repo,
                bus,
                scheduler,
                router,
                detector,
                executor,
                pipeline,
                browser,
                adapters,
                detector_loops: DashMap::new(),
                run_cancels: DashMap::new(),
                shutdown: CancellationToken::new(),
                dispatch_rx: Mutex::new(Some(dispatch_rx)),
            }),
        }
    }

    pub fn bus(&self) -> EventBus {
        self.inner.bus.clone()
    }

    /// Recover crashed runs, rebuild scheduler/trigger state, and start
    /// the component loops
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        self.recover_crashed_runs().await?;

        let workflows = self.inner.repo.list_workflows().await?;
        for workflow in workflows.iter().filter(|w| w.is_active()) {
            if let Err(e) = self.activate(workflow).await {
                warn!(workflow_id = %workflow.id, error = %e, "failed to activate at boot");
            }
        }

        self.inner.scheduler.start();
        self.inner.router.start();

        // Consume dispatched run requests for the rest of the process
        let Some(mut rx) = self.inner.dispatch_rx.lock().await.take() else {
            return Err(EngineError::Conflict("manager already started".to_string()));
        };
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager.execute_from_request(request).await;
                });
            }
        });

        info!(workflows = workflows.len(), "manager started");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.scheduler.shutdown();
        self.inner.router.shutdown();
        for entry in self.inner.detector_loops.iter() {
            entry.value().cancel();
        }
        self.inner.detector_loops.clear();
    }

    // ------------------------------------------------------------------
    // Workflow lifecycle
    // ------------------------------------------------------------------

    /// Persist a workflow with its triggers and actions; active workflows
    /// are scheduled and armed immediately
    #[instrument(skip_all, fields(name = %spec.name))]
    pub async fn create_workflow(
        &self,
        spec: WorkflowSpec,
        triggers: Vec<TriggerConfig>,
        actions: Vec<ActionSpec>,
    ) -> Result<Workflow> {
        let mut workflow = Workflow::new(spec.name);
        workflow.status = spec.status.unwrap_or(WorkflowStatus::Active);
        workflow.schedule_kind = spec.schedule_kind.unwrap_or(ScheduleKind::None);
        workflow.schedule_spec = spec.schedule_spec;
        if let Some(tz) = spec.timezone {
            workflow.timezone = tz;
        }
        workflow.change_detection_enabled = spec.change_detection.is_some();
        workflow.change_detection = spec.change_detection;
        workflow.execution = spec.execution.unwrap_or_default();
        workflow.rate_limit = spec.rate_limit;
        workflow.playbook_id = spec.playbook_id;

        if let Some(steps) = spec.playbook {
            let playbook = self
                .inner
                .repo
                .create_playbook(Playbook::new(format!("{} playbook", workflow.name), steps))
                .await?;
            workflow.playbook_id = Some(playbook.id);
        }

        let workflow = self.inner.repo.create_workflow(workflow).await?;

        for config in triggers {
            self.inner
                .repo
                .create_trigger(Trigger::new(workflow.id, config))
                .await?;
        }
        for spec in actions {
            let mut action = Action::new(workflow.id, spec.kind, spec.order, spec.config);
            action.enabled = spec.enabled;
            action.retry_on_failure = spec.retry_on_failure;
            action.retry_attempts = spec.retry_attempts;
            action.retry_delay_ms = spec.retry_delay_ms;
            action.continue_on_error = spec.continue_on_error;
            self.inner.repo.create_action(action).await?;
        }

        if workflow.is_active() {
            self.activate(&workflow).await?;
        }
        Ok(workflow)
    }

    /// Apply a partial update; schedule and trigger state follow the new
    /// definition
    #[instrument(skip(self, patch))]
    pub async fn update_workflow(&self, id: Uuid, patch: WorkflowPatch) -> Result<Workflow> {
        let mut workflow = self.inner.repo.get_workflow(id).await?;

        let schedule_changed = patch.schedule_kind.is_some()
            || patch.schedule_spec.is_some()
            || patch.timezone.is_some()
            || patch.status.is_some()
            || patch.change_detection.is_some()
            || patch.change_detection_enabled.is_some()
            || patch.rate_limit.is_some();

        if let Some(name) = patch.name {
            workflow.name = name;
        }
        if let Some(status) = patch.status {
            workflow.status = status;
        }
        if let Some(kind) = patch.schedule_kind {
            workflow.schedule_kind = kind;
        }
        if let Some(spec) = patch.schedule_spec {
            workflow.schedule_spec = spec;
        }
        if let Some(tz) = patch.timezone {
            workflow.timezone = tz;
        }
        if let Some(enabled) = patch.change_detection_enabled {
            workflow.change_detection_enabled = enabled;
        }
        if let Some(config) = patch.change_detection {
            workflow.change_detection_enabled = true;
            workflow.change_detection = Some(config);
        }
        if let Some(playbook_id) = patch.playbook_id {
            workflow.playbook_id = Some(playbook_id);
        }
        if let Some(execution) = patch.execution {
            workflow.execution = execution;
        }
        if let Some(rate_limit) = patch.rate_limit {
            workflow.rate_limit = Some(rate_limit);
        }

        let workflow = self.inner.repo.update_workflow(workflow).await?;

        if schedule_changed {
            self.deactivate(workflow.id).await;
            if workflow.is_active() {
                self.activate(&workflow).await?;
            }
        }
        Ok(workflow)
    }

    /// Unschedule, disarm, and cascade-delete the workflow
    #[instrument(skip(self))]
    pub async fn delete_workflow(&self, id: Uuid) -> Result<()> {
        self.deactivate(id).await;
        self.inner.repo.delete_workflow(id).await?;
        Ok(())
    }

    pub async fn pause(&self, id: Uuid) -> Result<Workflow> {
        self.set_status(id, WorkflowStatus::Paused).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<Workflow> {
        self.set_status(id, WorkflowStatus::Active).await
    }

    async fn set_status(&self, id: Uuid, status: WorkflowStatus) -> Result<Workflow> {
        self.update_workflow(
            id,
            WorkflowPatch {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Execute one run; single-flight per workflow
    #[instrument(skip(self, data), fields(workflow_id = %id, trigger = trigger.as_str()))]
    pub async fn execute(
        &self,
        id: Uuid,
        trigger: RunTrigger,
        triggered_by: Option<String>,
        data: Option<Value>,
    ) -> Result<Run> {
        let workflow = self.inner.repo.get_workflow(id).await?;
        if self.inner.repo.find_active_run(id).await?.is_some() {
            return Err(EngineError::AlreadyRunning(id));
        }

        let mut run = self.create_run_with_retry(id, trigger, triggered_by, &data).await?;

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        run = self.inner.repo.update_run(run).await?;
        self.inner.bus.publish(EngineEvent::RunStarted {
            workflow_id: id,
            run_id: run.id,
            run_number: run.run_number,
            trigger,
        });

        let steps = match workflow.playbook_id {
            Some(playbook_id) => self.inner.repo.get_playbook(playbook_id).await?.steps,
            None => vec![],
        };

        let execution = &workflow.execution;
        let ctx = ExecutionContext::new(
            run.id,
            id,
            self.inner.browser.clone(),
            data,
            Duration::from_millis(execution.timeout_ms),
            BackoffPolicy::new(execution.retry_attempts, execution.retry_delay_ms),
            execution.max_concurrent_steps,
        );
        self.inner.run_cancels.insert(run.id, ctx.cancel.clone());

        let outcome = self.inner.executor.run(&steps, &ctx).await;
        // Each run owns its tab exclusively; close it on every exit path
        ctx.close_tab().await;
        self.inner.run_cancels.remove(&run.id);

        run.step_results = outcome.states;
        run.extracted_data = ctx.extracted_data();

        match outcome.result {
            Ok(()) => {
                let actions = self.inner.repo.list_actions(id).await?;
                let initial = ctx
                    .context_value()
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                let action_ctx = ActionContext::new(
                    run.id,
                    id,
                    initial,
                    self.inner.adapters.clone(),
                    self.inner.bus.clone(),
                );
                run.actions_executed = self.inner.pipeline.run(&actions, &action_ctx).await;
                run.finish(RunStatus::Success, None);
            }
            Err(EngineError::Timeout) => {
                run.finish(RunStatus::Timeout, Some("run exceeded its deadline".to_string()));
            }
            Err(EngineError::Cancelled) => {
                run.finish(RunStatus::Cancelled, Some("run cancelled".to_string()));
            }
            Err(e) => {
                run.finish(RunStatus::Failed, Some(e.to_string()));
            }
        }

        let run = self.inner.repo.update_run(run).await?;
        self.finalize_run(&workflow, &run).await;
        Ok(run)
    }

    /// Cancel a non-terminal run
    pub async fn cancel(&self, run_id: Uuid) -> Result<()> {
        if let Some(token) = self.inner.run_cancels.get(&run_id) {
            token.cancel();
            return Ok(());
        }
        let run = self.inner.repo.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "run {run_id} already {}",
                run.status.as_str()
            )));
        }
        // Pending but not yet driven by this process: close it directly
        let mut run = run;
        run.finish(RunStatus::Cancelled, Some("run cancelled".to_string()));
        self.inner.repo.update_run(run).await?;
        Ok(())
    }

    /// Webhook ingress, delegated to the trigger router
    pub async fn handle_webhook(
        &self,
        token: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<Uuid> {
        self.inner.router.handle_webhook(token, body, headers).await
    }

    /// Publish an application event for event triggers
    pub fn emit_event(&self, name: impl Into<String>, source: Option<String>, payload: Value) {
        self.inner.bus.publish(EngineEvent::Custom {
            name: name.into(),
            source,
            payload,
        });
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_workflow(&self, id: Uuid) -> Result<Workflow> {
        Ok(self.inner.repo.get_workflow(id).await?)
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        Ok(self.inner.repo.list_workflows().await?)
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Run> {
        Ok(self.inner.repo.get_run(id).await?)
    }

    pub async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>> {
        Ok(self.inner.repo.list_runs(filter).await?)
    }

    pub async fn list_changes(
        &self,
        filter: ChangeFilter,
    ) -> Result<Vec<watchflow_core::model::Change>> {
        Ok(self.inner.repo.list_changes(filter).await?)
    }

    pub async fn acknowledge_change(&self, id: Uuid) -> Result<watchflow_core::model::Change> {
        let mut change = self.inner.repo.get_change(id).await?;
        change.acknowledged = true;
        Ok(self.inner.repo.update_change(change).await?)
    }

    /// Per-workflow or global stats
    pub async fn stats(&self, id: Option<Uuid>) -> Result<Value> {
        match id {
            Some(id) => {
                let workflow = self.inner.repo.get_workflow(id).await?;
                let active = self.inner.repo.find_active_run(id).await?;
                Ok(json!({
                    "workflow_id": workflow.id,
                    "name": workflow.name,
                    "status": workflow.status,
                    "metrics": workflow.metrics,
                    "last_run": workflow.last_run,
                    "next_run": workflow.next_run,
                    "run_in_flight": active.is_some(),
                }))
            }
            None => {
                let workflows = self.inner.repo.list_workflows().await?;
                let mut by_status: HashMap<&'static str, usize> = HashMap::new();
                let mut total_runs = 0u64;
                let mut successful = 0u64;
                let mut failed = 0u64;
                let mut changes = 0u64;
                for workflow in &workflows {
                    *by_status.entry(workflow.status.as_str()).or_default() += 1;
                    total_runs += workflow.metrics.total_runs;
                    successful += workflow.metrics.successful_runs;
                    failed += workflow.metrics.failed_runs;
                    changes += workflow.metrics.changes_detected;
                }
                Ok(json!({
                    "workflows": workflows.len(),
                    "by_status": by_status,
                    "total_runs": total_runs,
                    "successful_runs": successful,
                    "failed_runs": failed,
                    "changes_detected": changes,
                }))
            }
        }
    }

    /// Temporal conflicts for a workflow within the range (default 24h)
    pub fn detect_conflicts(
        &self,
        id: Uuid,
        range: Option<Duration>,
    ) -> Vec<ScheduleConflict> {
        self.inner
            .scheduler
            .detect_conflicts(id, range.unwrap_or(Duration::from_secs(24 * 3600)))
    }

    /// Run the change detector once for every monitored URL of a workflow
    pub async fn detect_now(&self, id: Uuid) -> Result<Vec<crate::detector::ChangeResult>> {
        let workflow = self.inner.repo.get_workflow(id).await?;
        let config = workflow
            .change_detection
            .ok_or_else(|| EngineError::validation("workflow has no change detection config"))?;
        let mut results = Vec::new();
        for url in &config.urls {
            results.push(self.inner.detector.detect(id, url, &config).await?);
        }
        Ok(results)
    }

    /// Delete terminal runs older than the retention window
    pub async fn cleanup_runs(&self, days_to_keep: Option<i64>) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::days(days_to_keep.unwrap_or(DEFAULT_RETENTION_DAYS));
        Ok(self.inner.repo.cleanup_runs(cutoff).await?)
    }

    /// Delete acknowledged changes older than the retention window
    pub async fn cleanup_changes(&self, days_to_keep: Option<i64>) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::days(days_to_keep.unwrap_or(DEFAULT_RETENTION_DAYS));
        Ok(self.inner.repo.cleanup_changes(cutoff).await?)
    }

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------

    async fn execute_from_request(&self, request: RunRequest) {
        let workflow_id = request.workflow_id;
        let result = self
            .execute(
                workflow_id,
                request.trigger,
                request.triggered_by,
                request.data,
            )
            .await;
        match result {
            Ok(run) => debug!(%workflow_id, run_id = %run.id, status = run.status.as_str(), "queued run finished"),
            Err(EngineError::AlreadyRunning(_)) => {
                debug!(%workflow_id, "queued run skipped, already in flight");
            }
            Err(e) => warn!(%workflow_id, error = %e, "queued run failed"),
        }
        self.inner.scheduler.on_run_finished(workflow_id);
    }

    async fn create_run_with_retry(
        &self,
        workflow_id: Uuid,
        trigger: RunTrigger,
        triggered_by: Option<String>,
        data: &Option<Value>,
    ) -> Result<Run> {
        let mut attempt = 0;
        loop {
            let result = self
                .inner
                .repo
                .create_run(NewRun {
                    workflow_id,
                    trigger,
                    triggered_by: triggered_by.clone(),
                    input: data.clone(),
                })
                .await;
            match result {
                Ok(run) => return Ok(run),
                Err(e) if e.is_conflict() && attempt + 1 < CREATE_RUN_ATTEMPTS => {
                    attempt += 1;
                    debug!(%workflow_id, attempt, "run number conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn finalize_run(&self, workflow: &Workflow, run: &Run) {
        // Metrics and schedule bookkeeping; best effort
        match self.inner.repo.get_workflow(workflow.id).await {
            Ok(mut fresh) => {
                fresh.metrics.record_run(
                    run.status == RunStatus::Success,
                    run.duration_ms.unwrap_or(0),
                );
                fresh.last_run = run.completed_at;
                fresh.next_run = self.inner.scheduler.next_run(workflow.id);
                if let Err(e) = self.inner.repo.update_workflow(fresh).await {
                    warn!(workflow_id = %workflow.id, error = %e, "failed to update metrics");
                }
            }
            Err(e) => warn!(workflow_id = %workflow.id, error = %e, "failed to load workflow"),
        }

        match run.status {
            RunStatus::Success => {
                self.inner.bus.publish(EngineEvent::RunCompleted {
                    workflow_id: workflow.id,
                    run_id: run.id,
                    duration_ms: run.duration_ms.unwrap_or(0),
                });
                self.inner
                    .router
                    .on_workflow_completed(workflow.id, &run.extracted_data)
                    .await;
            }
            status => {
                self.inner.bus.publish(EngineEvent::RunFailed {
                    workflow_id: workflow.id,
                    run_id: run.id,
                    status,
                    error: run.error.clone().unwrap_or_default(),
                });
            }
        }
    }

    async fn activate(&self, workflow: &Workflow) -> Result<()> {
        if let Err(e) = self.inner.scheduler.schedule(workflow).await {
            // Scheduling cannot proceed: flip the workflow to error
            if matches!(e, EngineError::Validation(_)) {
                error!(workflow_id = %workflow.id, error = %e, "invalid schedule, marking workflow error");
                let mut broken = workflow.clone();
                broken.status = WorkflowStatus::Error;
                let _ = self.inner.repo.update_workflow(broken).await;
            }
            return Err(e);
        }
        self.inner.router.arm_workflow(workflow).await?;

        if workflow.change_detection_enabled {
            if let Some(config) = workflow.change_detection.clone() {
                if !config.urls.is_empty() {
                    let cancel = self.inner.shutdown.child_token();
                    self.inner
                        .detector_loops
                        .insert(workflow.id, cancel.clone());
                    let detector = self.inner.detector.clone();
                    let workflow_id = workflow.id;
                    tokio::spawn(async move {
                        detector.run_loop(workflow_id, config, cancel).await;
                    });
                }
            }
        }

        // Surface the projected next firing on the workflow row
        if let Some(next) = self.inner.scheduler.next_run(workflow.id) {
            if let Ok(mut fresh) = self.inner.repo.get_workflow(workflow.id).await {
                fresh.next_run = Some(next);
                let _ = self.inner.repo.update_workflow(fresh).await;
            }
        }
        Ok(())
    }

    async fn deactivate(&self, workflow_id: Uuid) {
        self.inner.scheduler.unschedule(workflow_id).await;
        self.inner.router.disarm_workflow(workflow_id);
        if let Some((_, cancel)) = self.inner.detector_loops.remove(&workflow_id) {
            cancel.cancel();
        }
    }

    /// Runs crashed mid-flight in a previous process are marked failed
    async fn recover_crashed_runs(&self) -> Result<()> {
        let stale = self.inner.repo.list_unfinished_runs().await?;
        for mut run in stale {
            warn!(run_id = %run.id, workflow_id = %run.workflow_id, "recovering crashed run");
            if run.started_at.is_none() {
                run.started_at = Some(run.created_at);
            }
            run.finish(RunStatus::Failed, Some("recovered after restart".to_string()));
            let workflow_id = run.workflow_id;
            let run = self.inner.repo.update_run(run).await?;
            if let Ok(workflow) = self.inner.repo.get_workflow(workflow_id).await {
                self.finalize_run(&workflow, &run).await;
            }
        }
        Ok(())
    }
}
