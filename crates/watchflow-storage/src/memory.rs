//! In-memory Repository implementation
//!
//! Primarily for tests and development. Provides the same semantics as
//! the PostgreSQL implementation, including atomic run-number assignment
//! and cascade deletion.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use watchflow_core::bus::{EngineEvent, EventBus};
use watchflow_core::model::{
    Action, Change, ContentSnapshot, Playbook, Run, RunStatus, Schedule, Trigger, Workflow,
};

use crate::error::StorageError;
use crate::repository::{ChangeFilter, NewRun, Repository, RunFilter};

/// In-memory repository backed by `parking_lot` maps
///
/// All mutation methods take a write lock briefly; no I/O happens under
/// any lock.
pub struct InMemoryRepository {
    bus: EventBus,
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    playbooks: RwLock<HashMap<Uuid, Playbook>>,
    triggers: RwLock<HashMap<Uuid, Trigger>>,
    actions: RwLock<HashMap<Uuid, Action>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    runs: RwLock<HashMap<Uuid, Run>>,
    changes: RwLock<HashMap<Uuid, Change>>,
    snapshots: RwLock<HashMap<(Uuid, String), ContentSnapshot>>,
    /// Preserves insertion order for action tie-breaking
    action_seq: RwLock<HashMap<Uuid, u64>>,
    next_action_seq: RwLock<u64>,
}

impl InMemoryRepository {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            workflows: RwLock::new(HashMap::new()),
            playbooks: RwLock::new(HashMap::new()),
            triggers: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            schedules: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            changes: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            action_seq: RwLock::new(HashMap::new()),
            next_action_seq: RwLock::new(0),
        }
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow, StorageError> {
        {
            let mut workflows = self.workflows.write();
            if workflows.contains_key(&workflow.id) {
                return Err(StorageError::conflict(format!(
                    "workflow {} already exists",
                    workflow.id
                )));
            }
            workflows.insert(workflow.id, workflow.clone());
        }
        self.bus.publish(EngineEvent::WorkflowCreated {
            workflow_id: workflow.id,
            name: workflow.name.clone(),
        });
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StorageError> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("workflow", id))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StorageError> {
        let mut workflows: Vec<Workflow> = self.workflows.read().values().cloned().collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    async fn update_workflow(&self, mut workflow: Workflow) -> Result<Workflow, StorageError> {
        workflow.updated_at = Utc::now();
        {
            let mut workflows = self.workflows.write();
            if !workflows.contains_key(&workflow.id) {
                return Err(StorageError::not_found("workflow", workflow.id));
            }
            workflows.insert(workflow.id, workflow.clone());
        }
        self.bus.publish(EngineEvent::WorkflowUpdated {
            workflow_id: workflow.id,
        });
        Ok(workflow)
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), StorageError> {
        {
            let mut workflows = self.workflows.write();
            if workflows.remove(&id).is_none() {
                return Err(StorageError::not_found("workflow", id));
            }
            self.triggers.write().retain(|_, t| t.workflow_id != id);
            self.actions.write().retain(|_, a| a.workflow_id != id);
            self.schedules.write().retain(|_, s| s.workflow_id != id);
            self.runs.write().retain(|_, r| r.workflow_id != id);
            self.changes.write().retain(|_, c| c.workflow_id != id);
            self.snapshots.write().retain(|(wid, _), _| *wid != id);
        }
        debug!(%id, "cascade-deleted workflow");
        self.bus
            .publish(EngineEvent::WorkflowDeleted { workflow_id: id });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Playbooks
    // ------------------------------------------------------------------

    async fn create_playbook(&self, playbook: Playbook) -> Result<Playbook, StorageError> {
        self.playbooks.write().insert(playbook.id, playbook.clone());
        Ok(playbook)
    }

    async fn get_playbook(&self, id: Uuid) -> Result<Playbook, StorageError> {
        self.playbooks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("playbook", id))
    }

    async fn list_playbooks(&self) -> Result<Vec<Playbook>, StorageError> {
        let mut playbooks: Vec<Playbook> = self.playbooks.read().values().cloned().collect();
        playbooks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(playbooks)
    }

    async fn delete_playbook(&self, id: Uuid) -> Result<(), StorageError> {
        self.playbooks
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("playbook", id))
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    async fn create_trigger(&self, trigger: Trigger) -> Result<Trigger, StorageError> {
        if !self.workflows.read().contains_key(&trigger.workflow_id) {
            return Err(StorageError::not_found("workflow", trigger.workflow_id));
        }
        self.triggers.write().insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    async fn get_trigger(&self, id: Uuid) -> Result<Trigger, StorageError> {
        self.triggers
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("trigger", id))
    }

    async fn list_triggers(
        &self,
        workflow_id: Option<Uuid>,
    ) -> Result<Vec<Trigger>, StorageError> {
        let mut triggers: Vec<Trigger> = self
            .triggers
            .read()
            .values()
            .filter(|t| workflow_id.map(|id| t.workflow_id == id).unwrap_or(true))
            .cloned()
            .collect();
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(triggers)
    }

    async fn update_trigger(&self, mut trigger: Trigger) -> Result<Trigger, StorageError> {
        trigger.updated_at = Utc::now();
        let mut triggers = self.triggers.write();
        if !triggers.contains_key(&trigger.id) {
            return Err(StorageError::not_found("trigger", trigger.id));
        }
        triggers.insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    async fn delete_trigger(&self, id: Uuid) -> Result<(), StorageError> {
        self.triggers
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("trigger", id))
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    async fn create_action(&self, action: Action) -> Result<Action, StorageError> {
        if !self.workflows.read().contains_key(&action.workflow_id) {
            return Err(StorageError::not_found("workflow", action.workflow_id));
        }
        let seq = {
            let mut next = self.next_action_seq.write();
            *next += 1;
            *next
        };
        self.action_seq.write().insert(action.id, seq);
        self.actions.write().insert(action.id, action.clone());
        Ok(action)
    }

    async fn get_action(&self, id: Uuid) -> Result<Action, StorageError> {
        self.actions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("action", id))
    }

    async fn list_actions(&self, workflow_id: Uuid) -> Result<Vec<Action>, StorageError> {
        let seqs = self.action_seq.read();
        let mut actions: Vec<Action> = self
            .actions
            .read()
            .values()
            .filter(|a| a.workflow_id == workflow_id)
            .cloned()
            .collect();
        actions.sort_by(|a, b| {
            a.order.cmp(&b.order).then_with(|| {
                seqs.get(&a.id)
                    .copied()
                    .unwrap_or(0)
                    .cmp(&seqs.get(&b.id).copied().unwrap_or(0))
            })
        });
        Ok(actions)
    }

    async fn update_action(&self, mut action: Action) -> Result<Action, StorageError> {
        action.updated_at = Utc::now();
        let mut actions = self.actions.write();
        if !actions.contains_key(&action.id) {
            return Err(StorageError::not_found("action", action.id));
        }
        actions.insert(action.id, action.clone());
        Ok(action)
    }

    async fn delete_action(&self, id: Uuid) -> Result<(), StorageError> {
        self.action_seq.write().remove(&id);
        self.actions
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("action", id))
    }

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule, StorageError> {
        self.schedules.write().insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Schedule, StorageError> {
        self.schedules
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("schedule", id))
    }

    async fn list_schedules(
        &self,
        workflow_id: Option<Uuid>,
    ) -> Result<Vec<Schedule>, StorageError> {
        let mut schedules: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| workflow_id.map(|id| s.workflow_id == id).unwrap_or(true))
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(schedules)
    }

    async fn update_schedule(&self, mut schedule: Schedule) -> Result<Schedule, StorageError> {
        schedule.updated_at = Utc::now();
        let mut schedules = self.schedules.write();
        if !schedules.contains_key(&schedule.id) {
            return Err(StorageError::not_found("schedule", schedule.id));
        }
        schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<(), StorageError> {
        self.schedules
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("schedule", id))
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    async fn create_run(&self, new_run: NewRun) -> Result<Run, StorageError> {
        if !self.workflows.read().contains_key(&new_run.workflow_id) {
            return Err(StorageError::not_found("workflow", new_run.workflow_id));
        }
        let mut runs = self.runs.write();
        let next_number = runs
            .values()
            .filter(|r| r.workflow_id == new_run.workflow_id)
            .map(|r| r.run_number)
            .max()
            .unwrap_or(0)
            + 1;

        let mut run = Run::new(new_run.workflow_id, next_number, new_run.trigger);
        run.triggered_by = new_run.triggered_by;
        run.input = new_run.input;
        runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Run, StorageError> {
        self.runs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("run", id))
    }

    async fn update_run(&self, run: Run) -> Result<Run, StorageError> {
        let mut runs = self.runs.write();
        match runs.get(&run.id) {
            None => return Err(StorageError::not_found("run", run.id)),
            Some(existing) if existing.status.is_terminal() && existing.status != run.status => {
                return Err(StorageError::conflict(format!(
                    "run {} is terminal ({})",
                    run.id,
                    existing.status.as_str()
                )));
            }
            Some(_) => {}
        }
        runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StorageError> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .values()
            .filter(|r| filter.workflow_id.map(|id| r.workflow_id == id).unwrap_or(true))
            .filter(|r| filter.status.map(|s| r.status == s).unwrap_or(true))
            .filter(|r| filter.trigger.map(|t| r.trigger == t).unwrap_or(true))
            .filter(|r| filter.since.map(|s| r.created_at >= s).unwrap_or(true))
            .filter(|r| filter.until.map(|u| r.created_at <= u).unwrap_or(true))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(filter.page_size());
        Ok(runs)
    }

    async fn find_active_run(&self, workflow_id: Uuid) -> Result<Option<Run>, StorageError> {
        Ok(self
            .runs
            .read()
            .values()
            .find(|r| r.workflow_id == workflow_id && !r.status.is_terminal())
            .cloned())
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<Run>, StorageError> {
        Ok(self
            .runs
            .read()
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn cleanup_runs(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|_, r| {
            !(r.status.is_terminal() && r.completed_at.map(|c| c < older_than).unwrap_or(false))
        });
        Ok((before - runs.len()) as u64)
    }

    // ------------------------------------------------------------------
    // Changes
    // ------------------------------------------------------------------

    async fn create_change(&self, change: Change) -> Result<Change, StorageError> {
        self.changes.write().insert(change.id, change.clone());
        Ok(change)
    }

    async fn get_change(&self, id: Uuid) -> Result<Change, StorageError> {
        self.changes
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("change", id))
    }

    async fn update_change(&self, change: Change) -> Result<Change, StorageError> {
        let mut changes = self.changes.write();
        let existing = changes
            .get(&change.id)
            .ok_or_else(|| StorageError::not_found("change", change.id))?;
        // Only the flags are mutable
        let mut updated = existing.clone();
        updated.acknowledged = change.acknowledged;
        updated.notified = change.notified;
        changes.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn list_changes(&self, filter: ChangeFilter) -> Result<Vec<Change>, StorageError> {
        let mut changes: Vec<Change> = self
            .changes
            .read()
            .values()
            .filter(|c| filter.workflow_id.map(|id| c.workflow_id == id).unwrap_or(true))
            .filter(|c| filter.kind.map(|k| c.kind == k).unwrap_or(true))
            .filter(|c| filter.severity.map(|s| c.severity == s).unwrap_or(true))
            .filter(|c| filter.acknowledged.map(|a| c.acknowledged == a).unwrap_or(true))
            .filter(|c| filter.since.map(|s| c.detected_at >= s).unwrap_or(true))
            .filter(|c| filter.until.map(|u| c.detected_at <= u).unwrap_or(true))
            .cloned()
            .collect();
        changes.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        changes.truncate(filter.page_size());
        Ok(changes)
    }

    async fn cleanup_changes(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut changes = self.changes.write();
        let before = changes.len();
        changes.retain(|_, c| !(c.acknowledged && c.detected_at < older_than));
        Ok((before - changes.len()) as u64)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    async fn get_snapshot(
        &self,
        workflow_id: Uuid,
        url: &str,
    ) -> Result<Option<ContentSnapshot>, StorageError> {
        Ok(self
            .snapshots
            .read()
            .get(&(workflow_id, url.to_string()))
            .cloned())
    }

    async fn put_snapshot(&self, snapshot: ContentSnapshot) -> Result<(), StorageError> {
        self.snapshots
            .write()
            .insert((snapshot.workflow_id, snapshot.url.clone()), snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchflow_core::model::RunTrigger;

    fn repo() -> InMemoryRepository {
        InMemoryRepository::new(EventBus::default())
    }

    async fn seed_workflow(repo: &InMemoryRepository) -> Workflow {
        repo.create_workflow(Workflow::new("w"))
            .await
            .expect("should create workflow")
    }

    #[tokio::test]
    async fn test_run_numbers_monotonic() {
        let repo = repo();
        let workflow = seed_workflow(&repo).await;

        for expected in 1..=5 {
            let run = repo
                .create_run(NewRun {
                    workflow_id: workflow.id,
                    trigger: RunTrigger::Manual,
                    triggered_by: None,
                    input: None,
                })
                .await
                .expect("should create run");
            assert_eq!(run.run_number, expected);
        }
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let repo = repo();
        let workflow = seed_workflow(&repo).await;

        repo.create_trigger(Trigger::new(
            workflow.id,
            watchflow_core::model::TriggerConfig::Event {
                event_name: "e".to_string(),
                source: None,
            },
        ))
        .await
        .expect("should create trigger");

        repo.create_run(NewRun {
            workflow_id: workflow.id,
            trigger: RunTrigger::Manual,
            triggered_by: None,
            input: None,
        })
        .await
        .expect("should create run");

        repo.delete_workflow(workflow.id)
            .await
            .expect("should delete");

        assert!(repo.list_triggers(Some(workflow.id)).await.expect("list").is_empty());
        assert_eq!(repo.run_count(), 0);

        // Second delete reports NotFound
        let err = repo.delete_workflow(workflow.id).await.expect_err("gone");
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_terminal_runs_are_immutable() {
        let repo = repo();
        let workflow = seed_workflow(&repo).await;
        let mut run = repo
            .create_run(NewRun {
                workflow_id: workflow.id,
                trigger: RunTrigger::Manual,
                triggered_by: None,
                input: None,
            })
            .await
            .expect("should create run");

        run.started_at = Some(Utc::now());
        run.finish(RunStatus::Success, None);
        repo.update_run(run.clone()).await.expect("should update");

        run.status = RunStatus::Failed;
        let err = repo.update_run(run).await.expect_err("terminal");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_change_update_only_flags() {
        let repo = repo();
        let workflow = seed_workflow(&repo).await;
        let change = repo
            .create_change(Change::new(
                workflow.id,
                "https://example.test",
                watchflow_core::model::ChangeKind::Content,
                80.0,
            ))
            .await
            .expect("should create change");

        let mut patch = change.clone();
        patch.acknowledged = true;
        patch.similarity = 0.0; // must be ignored
        let updated = repo.update_change(patch).await.expect("should update");

        assert!(updated.acknowledged);
        assert!((updated.similarity - 80.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_workflow_events_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let repo = InMemoryRepository::new(bus);

        let workflow = repo
            .create_workflow(Workflow::new("observed"))
            .await
            .expect("should create");

        let event = rx.recv().await.expect("should receive event");
        assert_eq!(event.event_type(), "workflow:created");
        assert_eq!(event.data()["workflow_id"], serde_json::json!(workflow.id));
    }

    #[tokio::test]
    async fn test_cleanup_changes_requires_ack() {
        let repo = repo();
        let workflow = seed_workflow(&repo).await;

        let mut acked = Change::new(workflow.id, "https://a.test", watchflow_core::model::ChangeKind::Content, 50.0);
        acked.acknowledged = true;
        acked.detected_at = Utc::now() - chrono::Duration::days(40);
        let mut fresh = acked.clone();
        fresh.id = Uuid::now_v7();
        fresh.acknowledged = false;

        repo.create_change(acked).await.expect("create");
        repo.create_change(fresh).await.expect("create");

        let removed = repo
            .cleanup_changes(Utc::now() - chrono::Duration::days(30))
            .await
            .expect("cleanup");
        assert_eq!(removed, 1);
    }
}
