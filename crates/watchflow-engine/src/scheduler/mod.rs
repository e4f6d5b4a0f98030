//! Scheduler
//!
//! Turns schedule specs into precisely-timed ready-queue insertions and
//! drives bounded-concurrency dispatch. Interval and once schedules run on
//! their own timers; rrule and cron are evaluated by a shared tick loop
//! that enqueues when the next computed instant falls inside the enqueue
//! window, then advances to the following occurrence.

pub mod conflict;
pub mod queue;
pub mod spec;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use watchflow_core::model::{Schedule, ScheduleKind, Workflow};
use watchflow_storage::Repository;

use crate::error::Result;
use conflict::{find_conflicts, ScheduleConflict};
use queue::{RunQueue, RunRequest};
use spec::ParsedSchedule;

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent run requests dispatched at once
    pub max_concurrent_workflows: usize,

    /// Tick period for rrule/cron evaluation
    pub tick_interval: Duration,

    /// Enqueue when the next firing is within this window of now
    pub enqueue_window: Duration,

    /// Occurrences projected per workflow for conflict detection
    pub conflict_projection_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            tick_interval: Duration::from_secs(60),
            enqueue_window: Duration::from_secs(60),
            conflict_projection_limit: 50,
        }
    }
}

struct Job {
    schedule_id: Uuid,
    parsed: ParsedSchedule,
    next_run: Option<DateTime<Utc>>,
    timer: Option<JoinHandle<()>>,
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// The scheduler component
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    repo: Arc<dyn Repository>,
    queue: Arc<RunQueue>,
    jobs: DashMap<Uuid, Job>,
    config: SchedulerConfig,
    dispatch_tx: mpsc::Sender<RunRequest>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create the scheduler; the returned receiver yields dispatched run
    /// requests in priority order, bounded by the concurrency cap
    pub fn new(
        repo: Arc<dyn Repository>,
        queue: Arc<RunQueue>,
        config: SchedulerConfig,
    ) -> (Self, mpsc::Receiver<RunRequest>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(64);
        (
            Self {
                inner: Arc::new(SchedulerInner {
                    repo,
                    queue,
                    jobs: DashMap::new(),
                    config,
                    dispatch_tx,
                    cancel: CancellationToken::new(),
                }),
            },
            dispatch_rx,
        )
    }

    pub fn queue(&self) -> Arc<RunQueue> {
        self.inner.queue.clone()
    }

    /// Spawn the tick and dispatch loops
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.tick_loop().await });

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.dispatch_loop().await });
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.jobs.clear();
    }

    /// Install (or replace) the schedule for a workflow
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    pub async fn schedule(&self, workflow: &Workflow) -> Result<()> {
        let parsed = ParsedSchedule::parse(
            workflow.schedule_kind,
            workflow.schedule_spec.as_deref(),
            &workflow.timezone,
        )?;

        self.unschedule(workflow.id).await;
        if parsed.kind() == ScheduleKind::None {
            return Ok(());
        }

        let now = Utc::now();
        let next_run = parsed.next_after(now);
        let schedule_id = self.upsert_schedule_row(workflow, next_run).await?;

        let timer = match parsed.kind() {
            ScheduleKind::Interval => {
                let period = parsed
                    .interval()
                    .unwrap_or(Duration::from_secs(60));
                Some(self.spawn_interval_timer(workflow.id, schedule_id, period))
            }
            ScheduleKind::Once => parsed
                .once_at()
                .map(|at| self.spawn_once_timer(workflow.id, schedule_id, at)),
            _ => None,
        };

        self.inner.jobs.insert(
            workflow.id,
            Job {
                schedule_id,
                parsed,
                next_run,
                timer,
            },
        );
        info!(schedule_kind = workflow.schedule_kind.as_str(), "workflow scheduled");
        Ok(())
    }

    /// Remove the workflow's scheduler entry; idempotent
    pub async fn unschedule(&self, workflow_id: Uuid) {
        if let Some((_, job)) = self.inner.jobs.remove(&workflow_id) {
            let schedule_id = job.schedule_id;
            drop(job); // aborts the timer
            if let Ok(mut row) = self.inner.repo.get_schedule(schedule_id).await {
                row.enabled = false;
                if let Err(e) = self.inner.repo.update_schedule(row).await {
                    warn!(%workflow_id, error = %e, "failed to disable schedule row");
                }
            }
        }
        self.inner.queue.remove_workflow(workflow_id);
    }

    /// Release the workflow's dispatch slot after its run finished
    pub fn on_run_finished(&self, workflow_id: Uuid) {
        self.inner.queue.mark_done(workflow_id);
    }

    pub fn next_run(&self, workflow_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner.jobs.get(&workflow_id).and_then(|j| j.next_run)
    }

    pub fn is_scheduled(&self, workflow_id: Uuid) -> bool {
        self.inner.jobs.contains_key(&workflow_id)
    }

    /// Report pairs of firings within five minutes of each other inside
    /// the given range
    pub fn detect_conflicts(
        &self,
        workflow_id: Uuid,
        range: Duration,
    ) -> Vec<ScheduleConflict> {
        let now = Utc::now();
        let until = now + chrono::Duration::from_std(range).unwrap_or(chrono::Duration::hours(24));
        let limit = self.inner.config.conflict_projection_limit;

        let Some(target) = self.inner.jobs.get(&workflow_id) else {
            return vec![];
        };
        let target_times = target.parsed.occurrences(now, until, limit);
        drop(target);

        let others: Vec<(Uuid, Vec<DateTime<Utc>>)> = self
            .inner
            .jobs
            .iter()
            .filter(|entry| *entry.key() != workflow_id)
            .map(|entry| (*entry.key(), entry.parsed.occurrences(now, until, limit)))
            .collect();

        find_conflicts(workflow_id, &target_times, &others)
    }

    async fn upsert_schedule_row(
        &self,
        workflow: &Workflow,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<Uuid> {
        let existing = self
            .inner
            .repo
            .list_schedules(Some(workflow.id))
            .await?
            .into_iter()
            .next();

        match existing {
            Some(mut row) => {
                row.kind = workflow.schedule_kind;
                row.spec = workflow.schedule_spec.clone();
                row.timezone = workflow.timezone.clone();
                row.enabled = true;
                row.next_run = next_run;
                let row = self.inner.repo.update_schedule(row).await?;
                Ok(row.id)
            }
            None => {
                let mut row = Schedule::for_workflow(
                    workflow.id,
                    workflow.schedule_kind,
                    workflow.schedule_spec.clone(),
                    workflow.timezone.clone(),
                );
                row.next_run = next_run;
                let row = self.inner.repo.create_schedule(row).await?;
                Ok(row.id)
            }
        }
    }

    fn spawn_interval_timer(
        &self,
        workflow_id: Uuid,
        schedule_id: Uuid,
        period: Duration,
    ) -> JoinHandle<()> {
        let queue = self.inner.queue.clone();
        let cancel = self.inner.cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First fire happens one period from now
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                queue.enqueue(
                    RunRequest::new(workflow_id, watchflow_core::model::RunTrigger::Schedule)
                        .with_triggered_by(schedule_id.to_string()),
                );
            }
        })
    }

    fn spawn_once_timer(
        &self,
        workflow_id: Uuid,
        schedule_id: Uuid,
        at: DateTime<Utc>,
    ) -> JoinHandle<()> {
        let queue = self.inner.queue.clone();
        let jobs_owner = self.inner.clone();
        let cancel = self.inner.cancel.child_token();
        tokio::spawn(async move {
            let delay = (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_millis(0));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            queue.enqueue(
                RunRequest::new(workflow_id, watchflow_core::model::RunTrigger::Schedule)
                    .with_priority(10)
                    .with_scheduled_time(at)
                    .with_triggered_by(schedule_id.to_string()),
            );
            // One-shot schedules self-unschedule after firing
            jobs_owner.jobs.remove(&workflow_id);
        })
    }
}

impl SchedulerInner {
    async fn tick_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let window = chrono::Duration::from_std(self.config.enqueue_window)
            .unwrap_or(chrono::Duration::seconds(60));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            // Collect due firings without awaiting while iterating
            let mut due: Vec<(Uuid, Uuid, DateTime<Utc>, Option<DateTime<Utc>>)> = Vec::new();
            for mut entry in self.jobs.iter_mut() {
                let workflow_id = *entry.key();
                let job = entry.value_mut();
                if !matches!(job.parsed.kind(), ScheduleKind::Rrule | ScheduleKind::Cron) {
                    continue;
                }
                let next = match job.next_run.filter(|n| *n > now - window) {
                    Some(n) => n,
                    None => match job.parsed.next_after(now) {
                        Some(n) => n,
                        None => continue,
                    },
                };
                if next <= now + window {
                    let following = job.parsed.next_after(next);
                    job.next_run = following;
                    due.push((workflow_id, job.schedule_id, next, following));
                } else {
                    job.next_run = Some(next);
                }
            }

            for (workflow_id, schedule_id, at, following) in due {
                debug!(%workflow_id, fire_at = %at, "enqueuing scheduled firing");
                self.queue.enqueue(
                    RunRequest::new(workflow_id, watchflow_core::model::RunTrigger::Schedule)
                        .with_scheduled_time(at)
                        .with_triggered_by(schedule_id.to_string()),
                );
                if let Ok(mut row) = self.repo.get_schedule(schedule_id).await {
                    row.last_run = Some(at);
                    row.next_run = following;
                    if let Err(e) = self.repo.update_schedule(row).await {
                        warn!(%workflow_id, error = %e, "failed to persist schedule state");
                    }
                }
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.queue.notified() => {}
            }
            while let Some(request) = self.queue.pop_ready(self.config.max_concurrent_workflows) {
                if self.dispatch_tx.send(request).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchflow_core::bus::EventBus;
    use watchflow_core::model::RunTrigger;
    use watchflow_storage::InMemoryRepository;

    fn setup() -> (Scheduler, mpsc::Receiver<RunRequest>, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new(EventBus::default()));
        let queue = Arc::new(RunQueue::new());
        let (scheduler, rx) = Scheduler::new(repo.clone(), queue, SchedulerConfig::default());
        (scheduler, rx, repo)
    }

    async fn seed_workflow(repo: &InMemoryRepository, kind: ScheduleKind, spec: &str) -> Workflow {
        let mut workflow = Workflow::new("scheduled");
        workflow.schedule_kind = kind;
        workflow.schedule_spec = Some(spec.to_string());
        repo.create_workflow(workflow).await.expect("should create")
    }

    #[tokio::test]
    async fn test_interval_schedule_fires_repeatedly() {
        let (scheduler, mut rx, repo) = setup();
        scheduler.start();
        let workflow = seed_workflow(&repo, ScheduleKind::Interval, "20").await;

        scheduler.schedule(&workflow).await.expect("should schedule");

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("should fire")
            .expect("open channel");
        assert_eq!(first.workflow_id, workflow.id);
        assert_eq!(first.trigger, RunTrigger::Schedule);

        // Second firing only happens after the first run finishes
        scheduler.on_run_finished(workflow.id);
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("should fire again")
            .expect("open channel");
        assert_eq!(second.workflow_id, workflow.id);

        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected() {
        let (scheduler, _rx, repo) = setup();
        let workflow = seed_workflow(&repo, ScheduleKind::Cron, "now and then").await;

        let err = scheduler.schedule(&workflow).await.expect_err("invalid");
        assert!(matches!(err, crate::error::EngineError::Validation(_)));
        assert!(!scheduler.is_scheduled(workflow.id));
    }

    #[tokio::test]
    async fn test_unschedule_is_idempotent() {
        let (scheduler, _rx, repo) = setup();
        let workflow = seed_workflow(&repo, ScheduleKind::Interval, "60000").await;

        scheduler.schedule(&workflow).await.expect("should schedule");
        assert!(scheduler.is_scheduled(workflow.id));

        scheduler.unschedule(workflow.id).await;
        assert!(!scheduler.is_scheduled(workflow.id));
        scheduler.unschedule(workflow.id).await;
    }

    #[tokio::test]
    async fn test_schedule_row_persisted() {
        let (scheduler, _rx, repo) = setup();
        let workflow = seed_workflow(&repo, ScheduleKind::Cron, "0 7 * * *").await;

        scheduler.schedule(&workflow).await.expect("should schedule");
        let rows = repo
            .list_schedules(Some(workflow.id))
            .await
            .expect("should list");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].enabled);
        assert!(rows[0].next_run.is_some());

        // Re-scheduling reuses the row
        scheduler.schedule(&workflow).await.expect("should schedule");
        let rows = repo
            .list_schedules(Some(workflow.id))
            .await
            .expect("should list");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_detection_between_matching_crons() {
        let (scheduler, _rx, repo) = setup();
        let a = seed_workflow(&repo, ScheduleKind::Cron, "0 9 * * *").await;
        let b = seed_workflow(&repo, ScheduleKind::Cron, "2 9 * * *").await;

        scheduler.schedule(&a).await.expect("schedule a");
        scheduler.schedule(&b).await.expect("schedule b");

        let conflicts = scheduler.detect_conflicts(a.id, Duration::from_secs(48 * 3600));
        assert!(!conflicts.is_empty());
        assert!(conflicts
            .iter()
            .all(|c| c.workflow_a == a.id && c.workflow_b == b.id));
        assert_eq!(conflicts[0].severity, conflict::ConflictSeverity::Medium);

        let unrelated = scheduler.detect_conflicts(Uuid::now_v7(), Duration::from_secs(3600));
        assert!(unrelated.is_empty());
    }
}
