//! The typed repository trait
//!
//! Listing for runs and changes accepts composable filters and returns
//! results ordered newest first with a bounded page size. Two operations
//! are atomic by contract: run-number assignment (`create_run`) and
//! workflow cascade deletion (`delete_workflow`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use watchflow_core::model::{
    Action, Change, ChangeKind, ChangeSeverity, ContentSnapshot, Playbook, Run, RunStatus,
    RunTrigger, Schedule, Trigger, Workflow,
};

use crate::error::StorageError;

/// Hard cap applied to every list page
pub const MAX_PAGE_SIZE: usize = 200;

/// Input for atomic run creation; the repository assigns `run_number`
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_id: Uuid,
    pub trigger: RunTrigger,
    pub triggered_by: Option<String>,
    pub input: Option<serde_json::Value>,
}

/// Composable filter for run listings
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub trigger: Option<RunTrigger>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn for_workflow(workflow_id: Uuid) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Effective page size after clamping
    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE)
    }
}

/// Composable filter for change listings
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    pub workflow_id: Option<Uuid>,
    pub kind: Option<ChangeKind>,
    pub severity: Option<ChangeSeverity>,
    pub acknowledged: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ChangeFilter {
    pub fn for_workflow(workflow_id: Uuid) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Default::default()
        }
    }

    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE)
    }
}

/// Typed persistence for every entity
///
/// Implementations publish a lifecycle event on the bus after each
/// committed workflow mutation.
#[async_trait]
pub trait Repository: Send + Sync {
    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow, StorageError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StorageError>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StorageError>;

    async fn update_workflow(&self, workflow: Workflow) -> Result<Workflow, StorageError>;

    /// Cascade delete: removes the workflow and all dependent rows in one
    /// transaction. `NotFound` if the workflow is already gone.
    async fn delete_workflow(&self, id: Uuid) -> Result<(), StorageError>;

    // ------------------------------------------------------------------
    // Playbooks
    // ------------------------------------------------------------------

    async fn create_playbook(&self, playbook: Playbook) -> Result<Playbook, StorageError>;

    async fn get_playbook(&self, id: Uuid) -> Result<Playbook, StorageError>;

    async fn list_playbooks(&self) -> Result<Vec<Playbook>, StorageError>;

    async fn delete_playbook(&self, id: Uuid) -> Result<(), StorageError>;

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    async fn create_trigger(&self, trigger: Trigger) -> Result<Trigger, StorageError>;

    async fn get_trigger(&self, id: Uuid) -> Result<Trigger, StorageError>;

    async fn list_triggers(&self, workflow_id: Option<Uuid>)
        -> Result<Vec<Trigger>, StorageError>;

    async fn update_trigger(&self, trigger: Trigger) -> Result<Trigger, StorageError>;

    async fn delete_trigger(&self, id: Uuid) -> Result<(), StorageError>;

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    async fn create_action(&self, action: Action) -> Result<Action, StorageError>;

    async fn get_action(&self, id: Uuid) -> Result<Action, StorageError>;

    /// Ordered by `order`, ties broken by insertion order
    async fn list_actions(&self, workflow_id: Uuid) -> Result<Vec<Action>, StorageError>;

    async fn update_action(&self, action: Action) -> Result<Action, StorageError>;

    async fn delete_action(&self, id: Uuid) -> Result<(), StorageError>;

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule, StorageError>;

    async fn get_schedule(&self, id: Uuid) -> Result<Schedule, StorageError>;

    async fn list_schedules(
        &self,
        workflow_id: Option<Uuid>,
    ) -> Result<Vec<Schedule>, StorageError>;

    async fn update_schedule(&self, schedule: Schedule) -> Result<Schedule, StorageError>;

    async fn delete_schedule(&self, id: Uuid) -> Result<(), StorageError>;

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Atomic run creation: assigns the next `run_number` for the workflow
    /// and inserts in a single transaction. Concurrent callers collide
    /// with `Conflict`; the caller retries with bounded attempts.
    async fn create_run(&self, new_run: NewRun) -> Result<Run, StorageError>;

    async fn get_run(&self, id: Uuid) -> Result<Run, StorageError>;

    /// Full-row update; terminal rows must not be transitioned again
    async fn update_run(&self, run: Run) -> Result<Run, StorageError>;

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StorageError>;

    /// The single non-terminal run for a workflow, if any
    async fn find_active_run(&self, workflow_id: Uuid) -> Result<Option<Run>, StorageError>;

    /// All non-terminal runs across workflows (crash recovery sweep)
    async fn list_unfinished_runs(&self) -> Result<Vec<Run>, StorageError>;

    /// Delete terminal runs completed before the cutoff; returns the count
    async fn cleanup_runs(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError>;

    // ------------------------------------------------------------------
    // Changes
    // ------------------------------------------------------------------

    async fn create_change(&self, change: Change) -> Result<Change, StorageError>;

    async fn get_change(&self, id: Uuid) -> Result<Change, StorageError>;

    /// Only the `acknowledged` and `notified` flags are mutable
    async fn update_change(&self, change: Change) -> Result<Change, StorageError>;

    async fn list_changes(&self, filter: ChangeFilter) -> Result<Vec<Change>, StorageError>;

    /// Delete acknowledged changes detected before the cutoff
    async fn cleanup_changes(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError>;

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    async fn get_snapshot(
        &self,
        workflow_id: Uuid,
        url: &str,
    ) -> Result<Option<ContentSnapshot>, StorageError>;

    /// Atomic replace of the (workflow, URL) baseline
    async fn put_snapshot(&self, snapshot: ContentSnapshot) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_clamped() {
        let filter = RunFilter::default().with_limit(10_000);
        assert_eq!(filter.page_size(), MAX_PAGE_SIZE);

        let filter = RunFilter::default().with_limit(25);
        assert_eq!(filter.page_size(), 25);

        let filter = RunFilter::default();
        assert_eq!(filter.page_size(), MAX_PAGE_SIZE);
    }
}
