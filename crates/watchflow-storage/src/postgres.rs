//! PostgreSQL Repository implementation
//!
//! Runtime-checked queries over a connection pool. Run-number assignment
//! uses a single `INSERT ... SELECT MAX+1` statement guarded by a unique
//! index on (workflow_id, run_number); a unique violation surfaces as
//! `Conflict` and the caller retries.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use tracing::{debug, instrument};
use uuid::Uuid;

use watchflow_core::bus::{EngineEvent, EventBus};
use watchflow_core::model::{
    Action, ActionKind, CaptureMethod, Change, ChangeKind, ChangeSeverity, ContentSnapshot,
    Playbook, Run, RunStatus, RunTrigger, Schedule, ScheduleKind, Trigger, TriggerConfig,
    Workflow, WorkflowStatus,
};

use crate::error::StorageError;
use crate::repository::{ChangeFilter, NewRun, Repository, RunFilter};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Batch size for retention cleanup deletes
const CLEANUP_BATCH: i64 = 500;

/// PostgreSQL-backed repository
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
    bus: EventBus,
}

impl PostgresRepository {
    pub fn new(pool: PgPool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Connect and run pending migrations
    pub async fn connect(database_url: &str, bus: EventBus) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::invalid(format!("migration failed: {e}")))?;
        Ok(Self::new(pool, bus))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_db_error(e: sqlx::Error) -> StorageError {
        if let sqlx::Error::Database(db) = &e {
            match db.code().as_deref() {
                Some(UNIQUE_VIOLATION) => {
                    return StorageError::conflict(db.message().to_string());
                }
                Some(FOREIGN_KEY_VIOLATION) => {
                    return StorageError::NotFound(db.message().to_string());
                }
                _ => {}
            }
        }
        StorageError::Database(e)
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
struct WorkflowRow {
    id: Uuid,
    name: String,
    status: String,
    schedule_kind: String,
    schedule_spec: Option<String>,
    timezone: String,
    change_detection_enabled: bool,
    change_detection: Option<serde_json::Value>,
    playbook_id: Option<Uuid>,
    execution: serde_json::Value,
    rate_limit: Option<serde_json::Value>,
    metrics: serde_json::Value,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = StorageError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        Ok(Workflow {
            id: row.id,
            name: row.name,
            status: WorkflowStatus::from_str(&row.status).map_err(StorageError::invalid)?,
            schedule_kind: ScheduleKind::from_str(&row.schedule_kind)
                .map_err(StorageError::invalid)?,
            schedule_spec: row.schedule_spec,
            timezone: row.timezone,
            change_detection_enabled: row.change_detection_enabled,
            change_detection: row
                .change_detection
                .map(serde_json::from_value)
                .transpose()?,
            playbook_id: row.playbook_id,
            execution: serde_json::from_value(row.execution)?,
            rate_limit: row.rate_limit.map(serde_json::from_value).transpose()?,
            metrics: serde_json::from_value(row.metrics)?,
            last_run: row.last_run,
            next_run: row.next_run,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PlaybookRow {
    id: Uuid,
    name: String,
    steps: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PlaybookRow> for Playbook {
    type Error = StorageError;

    fn try_from(row: PlaybookRow) -> Result<Self, Self::Error> {
        Ok(Playbook {
            id: row.id,
            name: row.name,
            steps: serde_json::from_value(row.steps)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TriggerRow {
    id: Uuid,
    workflow_id: Uuid,
    config: serde_json::Value,
    trigger_count: i64,
    last_triggered: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TriggerRow> for Trigger {
    type Error = StorageError;

    fn try_from(row: TriggerRow) -> Result<Self, Self::Error> {
        let config: TriggerConfig = serde_json::from_value(row.config)?;
        Ok(Trigger {
            id: row.id,
            workflow_id: row.workflow_id,
            config,
            trigger_count: row.trigger_count.max(0) as u64,
            last_triggered: row.last_triggered,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ActionRow {
    id: Uuid,
    workflow_id: Uuid,
    kind: String,
    sort_order: i32,
    enabled: bool,
    retry_on_failure: bool,
    retry_attempts: i32,
    retry_delay_ms: i64,
    continue_on_error: bool,
    config: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ActionRow> for Action {
    type Error = StorageError;

    fn try_from(row: ActionRow) -> Result<Self, Self::Error> {
        Ok(Action {
            id: row.id,
            workflow_id: row.workflow_id,
            kind: ActionKind::from_str(&row.kind).map_err(StorageError::invalid)?,
            order: row.sort_order,
            enabled: row.enabled,
            retry_on_failure: row.retry_on_failure,
            retry_attempts: row.retry_attempts.max(0) as u32,
            retry_delay_ms: row.retry_delay_ms.max(0) as u64,
            continue_on_error: row.continue_on_error,
            config: row.config,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ScheduleRow {
    id: Uuid,
    workflow_id: Uuid,
    kind: String,
    spec: Option<String>,
    timezone: String,
    enabled: bool,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = StorageError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        Ok(Schedule {
            id: row.id,
            workflow_id: row.workflow_id,
            kind: ScheduleKind::from_str(&row.kind).map_err(StorageError::invalid)?,
            spec: row.spec,
            timezone: row.timezone,
            enabled: row.enabled,
            next_run: row.next_run,
            last_run: row.last_run,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: Uuid,
    workflow_id: Uuid,
    run_number: i64,
    status: String,
    trigger: String,
    triggered_by: Option<String>,
    input: Option<serde_json::Value>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    extracted_data: serde_json::Value,
    step_results: serde_json::Value,
    actions_executed: serde_json::Value,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for Run {
    type Error = StorageError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: row.id,
            workflow_id: row.workflow_id,
            run_number: row.run_number,
            status: RunStatus::from_str(&row.status).map_err(StorageError::invalid)?,
            trigger: RunTrigger::from_str(&row.trigger).map_err(StorageError::invalid)?,
            triggered_by: row.triggered_by,
            input: row.input,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms.map(|d| d.max(0) as u64),
            extracted_data: row.extracted_data,
            step_results: serde_json::from_value(row.step_results)?,
            actions_executed: serde_json::from_value(row.actions_executed)?,
            error: row.error,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ChangeRow {
    id: Uuid,
    workflow_id: Uuid,
    run_id: Option<Uuid>,
    url: String,
    kind: String,
    severity: String,
    similarity: f64,
    change_score: f64,
    previous_value: Option<String>,
    current_value: Option<String>,
    diff: serde_json::Value,
    screenshot: Option<String>,
    detected_at: DateTime<Utc>,
    acknowledged: bool,
    notified: bool,
}

impl TryFrom<ChangeRow> for Change {
    type Error = StorageError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(Change {
            id: row.id,
            workflow_id: row.workflow_id,
            run_id: row.run_id,
            url: row.url,
            kind: ChangeKind::from_str(&row.kind).map_err(StorageError::invalid)?,
            severity: ChangeSeverity::from_str(&row.severity).map_err(StorageError::invalid)?,
            similarity: row.similarity,
            change_score: row.change_score,
            previous_value: row.previous_value,
            current_value: row.current_value,
            diff: row.diff,
            screenshot: row.screenshot,
            detected_at: row.detected_at,
            acknowledged: row.acknowledged,
            notified: row.notified,
        })
    }
}

#[derive(Debug, FromRow)]
struct SnapshotRow {
    workflow_id: Uuid,
    url: String,
    method: String,
    content: serde_json::Value,
    content_hash: String,
    metadata: serde_json::Value,
    captured_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for ContentSnapshot {
    type Error = StorageError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(ContentSnapshot {
            workflow_id: row.workflow_id,
            url: row.url,
            method: CaptureMethod::from_str(&row.method).map_err(StorageError::invalid)?,
            content: row.content,
            content_hash: row.content_hash,
            metadata: serde_json::from_value(row.metadata)?,
            captured_at: row.captured_at,
        })
    }
}

const WORKFLOW_COLUMNS: &str = "id, name, status, schedule_kind, schedule_spec, timezone, \
    change_detection_enabled, change_detection, playbook_id, execution, rate_limit, metrics, \
    last_run, next_run, created_at, updated_at";

const RUN_COLUMNS: &str = "id, workflow_id, run_number, status, trigger, triggered_by, input, \
    started_at, completed_at, duration_ms, extracted_data, step_results, actions_executed, \
    error, created_at";

const CHANGE_COLUMNS: &str = "id, workflow_id, run_id, url, kind, severity, similarity, \
    change_score, previous_value, current_value, diff, screenshot, detected_at, acknowledged, \
    notified";

// ============================================================================
// Repository implementation
// ============================================================================

#[async_trait]
impl Repository for PostgresRepository {
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow, StorageError> {
        sqlx::query(
            "INSERT INTO workflows (id, name, status, schedule_kind, schedule_spec, timezone, \
             change_detection_enabled, change_detection, playbook_id, execution, rate_limit, \
             metrics, last_run, next_run, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.status.as_str())
        .bind(workflow.schedule_kind.as_str())
        .bind(&workflow.schedule_spec)
        .bind(&workflow.timezone)
        .bind(workflow.change_detection_enabled)
        .bind(
            workflow
                .change_detection
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(workflow.playbook_id)
        .bind(serde_json::to_value(&workflow.execution)?)
        .bind(workflow.rate_limit.as_ref().map(serde_json::to_value).transpose()?)
        .bind(serde_json::to_value(&workflow.metrics)?)
        .bind(workflow.last_run)
        .bind(workflow.next_run)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Self::map_db_error)?;

        self.bus.publish(EngineEvent::WorkflowCreated {
            workflow_id: workflow.id,
            name: workflow.name.clone(),
        });
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StorageError> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("workflow", id))?;
        row.try_into()
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StorageError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn update_workflow(&self, mut workflow: Workflow) -> Result<Workflow, StorageError> {
        workflow.updated_at = Utc::now();
        let result = sqlx::query(
            "UPDATE workflows SET name = $2, status = $3, schedule_kind = $4, \
             schedule_spec = $5, timezone = $6, change_detection_enabled = $7, \
             change_detection = $8, playbook_id = $9, execution = $10, rate_limit = $11, \
             metrics = $12, last_run = $13, next_run = $14, updated_at = $15 \
             WHERE id = $1",
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.status.as_str())
        .bind(workflow.schedule_kind.as_str())
        .bind(&workflow.schedule_spec)
        .bind(&workflow.timezone)
        .bind(workflow.change_detection_enabled)
        .bind(
            workflow
                .change_detection
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(workflow.playbook_id)
        .bind(serde_json::to_value(&workflow.execution)?)
        .bind(workflow.rate_limit.as_ref().map(serde_json::to_value).transpose()?)
        .bind(serde_json::to_value(&workflow.metrics)?)
        .bind(workflow.last_run)
        .bind(workflow.next_run)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("workflow", workflow.id));
        }
        self.bus.publish(EngineEvent::WorkflowUpdated {
            workflow_id: workflow.id,
        });
        Ok(workflow)
    }

    #[instrument(skip(self))]
    async fn delete_workflow(&self, id: Uuid) -> Result<(), StorageError> {
        // Dependent rows cascade via foreign keys
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("workflow", id));
        }
        debug!(%id, "cascade-deleted workflow");
        self.bus
            .publish(EngineEvent::WorkflowDeleted { workflow_id: id });
        Ok(())
    }

    async fn create_playbook(&self, playbook: Playbook) -> Result<Playbook, StorageError> {
        sqlx::query(
            "INSERT INTO playbooks (id, name, steps, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(playbook.id)
        .bind(&playbook.name)
        .bind(serde_json::to_value(&playbook.steps)?)
        .bind(playbook.created_at)
        .bind(playbook.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Self::map_db_error)?;
        Ok(playbook)
    }

    async fn get_playbook(&self, id: Uuid) -> Result<Playbook, StorageError> {
        let row = sqlx::query_as::<_, PlaybookRow>(
            "SELECT id, name, steps, created_at, updated_at FROM playbooks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("playbook", id))?;
        row.try_into()
    }

    async fn list_playbooks(&self) -> Result<Vec<Playbook>, StorageError> {
        let rows = sqlx::query_as::<_, PlaybookRow>(
            "SELECT id, name, steps, created_at, updated_at FROM playbooks \
             ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_playbook(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM playbooks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("playbook", id));
        }
        Ok(())
    }

    async fn create_trigger(&self, trigger: Trigger) -> Result<Trigger, StorageError> {
        sqlx::query(
            "INSERT INTO triggers (id, workflow_id, kind, config, trigger_count, \
             last_triggered, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(trigger.id)
        .bind(trigger.workflow_id)
        .bind(trigger.kind().as_str())
        .bind(serde_json::to_value(&trigger.config)?)
        .bind(trigger.trigger_count as i64)
        .bind(trigger.last_triggered)
        .bind(trigger.created_at)
        .bind(trigger.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Self::map_db_error)?;
        Ok(trigger)
    }

    async fn get_trigger(&self, id: Uuid) -> Result<Trigger, StorageError> {
        let row = sqlx::query_as::<_, TriggerRow>(
            "SELECT id, workflow_id, config, trigger_count, last_triggered, created_at, \
             updated_at FROM triggers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("trigger", id))?;
        row.try_into()
    }

    async fn list_triggers(
        &self,
        workflow_id: Option<Uuid>,
    ) -> Result<Vec<Trigger>, StorageError> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            "SELECT id, workflow_id, config, trigger_count, last_triggered, created_at, \
             updated_at FROM triggers \
             WHERE ($1::uuid IS NULL OR workflow_id = $1) \
             ORDER BY created_at ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_trigger(&self, mut trigger: Trigger) -> Result<Trigger, StorageError> {
        trigger.updated_at = Utc::now();
        let result = sqlx::query(
            "UPDATE triggers SET config = $2, trigger_count = $3, last_triggered = $4, \
             updated_at = $5 WHERE id = $1",
        )
        .bind(trigger.id)
        .bind(serde_json::to_value(&trigger.config)?)
        .bind(trigger.trigger_count as i64)
        .bind(trigger.last_triggered)
        .bind(trigger.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("trigger", trigger.id));
        }
        Ok(trigger)
    }

    async fn delete_trigger(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM triggers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("trigger", id));
        }
        Ok(())
    }

    async fn create_action(&self, action: Action) -> Result<Action, StorageError> {
        sqlx::query(
            "INSERT INTO actions (id, workflow_id, kind, sort_order, enabled, \
             retry_on_failure, retry_attempts, retry_delay_ms, continue_on_error, config, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(action.id)
        .bind(action.workflow_id)
        .bind(action.kind.as_str())
        .bind(action.order)
        .bind(action.enabled)
        .bind(action.retry_on_failure)
        .bind(action.retry_attempts as i32)
        .bind(action.retry_delay_ms as i64)
        .bind(action.continue_on_error)
        .bind(&action.config)
        .bind(action.created_at)
        .bind(action.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Self::map_db_error)?;
        Ok(action)
    }

    async fn get_action(&self, id: Uuid) -> Result<Action, StorageError> {
        let row = sqlx::query_as::<_, ActionRow>(
            "SELECT id, workflow_id, kind, sort_order, enabled, retry_on_failure, \
             retry_attempts, retry_delay_ms, continue_on_error, config, created_at, updated_at \
             FROM actions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("action", id))?;
        row.try_into()
    }

    async fn list_actions(&self, workflow_id: Uuid) -> Result<Vec<Action>, StorageError> {
        let rows = sqlx::query_as::<_, ActionRow>(
            "SELECT id, workflow_id, kind, sort_order, enabled, retry_on_failure, \
             retry_attempts, retry_delay_ms, continue_on_error, config, created_at, updated_at \
             FROM actions WHERE workflow_id = $1 ORDER BY sort_order ASC, seq ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_action(&self, mut action: Action) -> Result<Action, StorageError> {
        action.updated_at = Utc::now();
        let result = sqlx::query(
            "UPDATE actions SET kind = $2, sort_order = $3, enabled = $4, \
             retry_on_failure = $5, retry_attempts = $6, retry_delay_ms = $7, \
             continue_on_error = $8, config = $9, updated_at = $10 WHERE id = $1",
        )
        .bind(action.id)
        .bind(action.kind.as_str())
        .bind(action.order)
        .bind(action.enabled)
        .bind(action.retry_on_failure)
        .bind(action.retry_attempts as i32)
        .bind(action.retry_delay_ms as i64)
        .bind(action.continue_on_error)
        .bind(&action.config)
        .bind(action.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("action", action.id));
        }
        Ok(action)
    }

    async fn delete_action(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM actions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("action", id));
        }
        Ok(())
    }

    async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule, StorageError> {
        sqlx::query(
            "INSERT INTO schedules (id, workflow_id, kind, spec, timezone, enabled, next_run, \
             last_run, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(schedule.id)
        .bind(schedule.workflow_id)
        .bind(schedule.kind.as_str())
        .bind(&schedule.spec)
        .bind(&schedule.timezone)
        .bind(schedule.enabled)
        .bind(schedule.next_run)
        .bind(schedule.last_run)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Self::map_db_error)?;
        Ok(schedule)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Schedule, StorageError> {
        let row = sqlx::query_as::<_, ScheduleRow>(
            "SELECT id, workflow_id, kind, spec, timezone, enabled, next_run, last_run, \
             created_at, updated_at FROM schedules WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("schedule", id))?;
        row.try_into()
    }

    async fn list_schedules(
        &self,
        workflow_id: Option<Uuid>,
    ) -> Result<Vec<Schedule>, StorageError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            "SELECT id, workflow_id, kind, spec, timezone, enabled, next_run, last_run, \
             created_at, updated_at FROM schedules \
             WHERE ($1::uuid IS NULL OR workflow_id = $1) ORDER BY created_at ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_schedule(&self, mut schedule: Schedule) -> Result<Schedule, StorageError> {
        schedule.updated_at = Utc::now();
        let result = sqlx::query(
            "UPDATE schedules SET kind = $2, spec = $3, timezone = $4, enabled = $5, \
             next_run = $6, last_run = $7, updated_at = $8 WHERE id = $1",
        )
        .bind(schedule.id)
        .bind(schedule.kind.as_str())
        .bind(&schedule.spec)
        .bind(&schedule.timezone)
        .bind(schedule.enabled)
        .bind(schedule.next_run)
        .bind(schedule.last_run)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("schedule", schedule.id));
        }
        Ok(schedule)
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("schedule", id));
        }
        Ok(())
    }

    #[instrument(skip(self, new_run), fields(workflow_id = %new_run.workflow_id))]
    async fn create_run(&self, new_run: NewRun) -> Result<Run, StorageError> {
        // MAX+1 in the insert itself; the unique index on
        // (workflow_id, run_number) turns a concurrent race into Conflict
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "INSERT INTO runs (id, workflow_id, run_number, status, trigger, triggered_by, \
             input, extracted_data, step_results, actions_executed, created_at) \
             SELECT $1, $2, COALESCE(MAX(run_number), 0) + 1, 'pending', $3, $4, $5, \
             '{{}}'::jsonb, '{{}}'::jsonb, '[]'::jsonb, NOW() \
             FROM runs WHERE workflow_id = $2 \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(new_run.workflow_id)
        .bind(new_run.trigger.as_str())
        .bind(&new_run.triggered_by)
        .bind(&new_run.input)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::map_db_error)?;
        row.try_into()
    }

    async fn get_run(&self, id: Uuid) -> Result<Run, StorageError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("run", id))?;
        row.try_into()
    }

    async fn update_run(&self, run: Run) -> Result<Run, StorageError> {
        // Terminal rows may only have their flags re-written with the same
        // status; transitioning a terminal run is a conflict
        let result = sqlx::query(
            "UPDATE runs SET status = $2, started_at = $3, completed_at = $4, \
             duration_ms = $5, extracted_data = $6, step_results = $7, \
             actions_executed = $8, error = $9 \
             WHERE id = $1 \
               AND (status NOT IN ('success', 'failed', 'cancelled', 'timeout') \
                    OR status = $2)",
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.duration_ms.map(|d| d as i64))
        .bind(&run.extracted_data)
        .bind(serde_json::to_value(&run.step_results)?)
        .bind(serde_json::to_value(&run.actions_executed)?)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing row from a terminal one
            let exists = sqlx::query("SELECT 1 FROM runs WHERE id = $1")
                .bind(run.id)
                .fetch_optional(&self.pool)
                .await?;
            return Err(match exists {
                Some(_) => StorageError::conflict(format!("run {} is terminal", run.id)),
                None => StorageError::not_found("run", run.id),
            });
        }
        Ok(run)
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StorageError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE ($1::uuid IS NULL OR workflow_id = $1) \
               AND ($2::text IS NULL OR status = $2) \
               AND ($3::text IS NULL OR trigger = $3) \
               AND ($4::timestamptz IS NULL OR created_at >= $4) \
               AND ($5::timestamptz IS NULL OR created_at <= $5) \
             ORDER BY created_at DESC LIMIT $6"
        ))
        .bind(filter.workflow_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.trigger.map(|t| t.as_str()))
        .bind(filter.since)
        .bind(filter.until)
        .bind(filter.page_size() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_active_run(&self, workflow_id: Uuid) -> Result<Option<Run>, StorageError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE workflow_id = $1 AND status IN ('pending', 'running') LIMIT 1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<Run>, StorageError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status IN ('pending', 'running')"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self))]
    async fn cleanup_runs(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut total = 0u64;
        loop {
            let result = sqlx::query(
                "DELETE FROM runs WHERE id IN (\
                 SELECT id FROM runs \
                 WHERE status IN ('success', 'failed', 'cancelled', 'timeout') \
                   AND completed_at < $1 LIMIT $2)",
            )
            .bind(older_than)
            .bind(CLEANUP_BATCH)
            .execute(&self.pool)
            .await?;
            let removed = result.rows_affected();
            total += removed;
            if removed == 0 {
                break;
            }
        }
        debug!(removed = total, "run retention cleanup");
        Ok(total)
    }

    async fn create_change(&self, change: Change) -> Result<Change, StorageError> {
        sqlx::query(&format!(
            "INSERT INTO changes ({CHANGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(change.id)
        .bind(change.workflow_id)
        .bind(change.run_id)
        .bind(&change.url)
        .bind(change.kind.as_str())
        .bind(change.severity.as_str())
        .bind(change.similarity)
        .bind(change.change_score)
        .bind(&change.previous_value)
        .bind(&change.current_value)
        .bind(&change.diff)
        .bind(&change.screenshot)
        .bind(change.detected_at)
        .bind(change.acknowledged)
        .bind(change.notified)
        .execute(&self.pool)
        .await
        .map_err(Self::map_db_error)?;
        Ok(change)
    }

    async fn get_change(&self, id: Uuid) -> Result<Change, StorageError> {
        let row = sqlx::query_as::<_, ChangeRow>(&format!(
            "SELECT {CHANGE_COLUMNS} FROM changes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("change", id))?;
        row.try_into()
    }

    async fn update_change(&self, change: Change) -> Result<Change, StorageError> {
        let row = sqlx::query_as::<_, ChangeRow>(&format!(
            "UPDATE changes SET acknowledged = $2, notified = $3 WHERE id = $1 \
             RETURNING {CHANGE_COLUMNS}"
        ))
        .bind(change.id)
        .bind(change.acknowledged)
        .bind(change.notified)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("change", change.id))?;
        row.try_into()
    }

    async fn list_changes(&self, filter: ChangeFilter) -> Result<Vec<Change>, StorageError> {
        let rows = sqlx::query_as::<_, ChangeRow>(&format!(
            "SELECT {CHANGE_COLUMNS} FROM changes \
             WHERE ($1::uuid IS NULL OR workflow_id = $1) \
               AND ($2::text IS NULL OR kind = $2) \
               AND ($3::text IS NULL OR severity = $3) \
               AND ($4::boolean IS NULL OR acknowledged = $4) \
               AND ($5::timestamptz IS NULL OR detected_at >= $5) \
               AND ($6::timestamptz IS NULL OR detected_at <= $6) \
             ORDER BY detected_at DESC LIMIT $7"
        ))
        .bind(filter.workflow_id)
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.severity.map(|s| s.as_str()))
        .bind(filter.acknowledged)
        .bind(filter.since)
        .bind(filter.until)
        .bind(filter.page_size() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self))]
    async fn cleanup_changes(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut total = 0u64;
        loop {
            let result = sqlx::query(
                "DELETE FROM changes WHERE id IN (\
                 SELECT id FROM changes \
                 WHERE acknowledged = TRUE AND detected_at < $1 LIMIT $2)",
            )
            .bind(older_than)
            .bind(CLEANUP_BATCH)
            .execute(&self.pool)
            .await?;
            let removed = result.rows_affected();
            total += removed;
            if removed == 0 {
                break;
            }
        }
        debug!(removed = total, "change retention cleanup");
        Ok(total)
    }

    async fn get_snapshot(
        &self,
        workflow_id: Uuid,
        url: &str,
    ) -> Result<Option<ContentSnapshot>, StorageError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT workflow_id, url, method, content, content_hash, metadata, captured_at \
             FROM snapshots WHERE workflow_id = $1 AND url = $2",
        )
        .bind(workflow_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn put_snapshot(&self, snapshot: ContentSnapshot) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO snapshots (workflow_id, url, method, content, content_hash, metadata, \
             captured_at) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (workflow_id, url) DO UPDATE SET method = EXCLUDED.method, \
             content = EXCLUDED.content, content_hash = EXCLUDED.content_hash, \
             metadata = EXCLUDED.metadata, captured_at = EXCLUDED.captured_at",
        )
        .bind(snapshot.workflow_id)
        .bind(&snapshot.url)
        .bind(snapshot.method.as_str())
        .bind(&snapshot.content)
        .bind(&snapshot.content_hash)
        .bind(serde_json::to_value(&snapshot.metadata)?)
        .bind(snapshot.captured_at)
        .execute(&self.pool)
        .await
        .map_err(Self::map_db_error)?;
        Ok(())
    }
}
