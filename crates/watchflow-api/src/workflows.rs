//! Workflow CRUD and execution endpoints

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::IntoParams;
use uuid::Uuid;

use watchflow_core::model::{RunStatus, RunTrigger, TriggerConfig, Workflow};
use watchflow_storage::RunFilter;
use watchflow_engine::{ActionSpec, WorkflowPatch, WorkflowSpec};

use crate::common::{ApiError, ApiResult};
use crate::AppState;

/// Request body for creating a workflow: the workflow spec fields plus
/// optional trigger and action lists
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    #[serde(flatten)]
    pub workflow: WorkflowSpec,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// Request body for manual execution
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Query params for run listings
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListRunsParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ConflictParams {
    /// Range to project, in hours (default 24)
    pub hours: Option<u64>,
}

#[utoipa::path(
    post,
    path = "/workflows",
    tag = "workflows",
    request_body(content = String, description = "Workflow spec plus triggers and actions"),
    responses(
        (status = 201, description = "Workflow created"),
        (status = 400, description = "Invalid spec"),
    )
)]
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let workflow = state
        .manager
        .create_workflow(request.workflow, request.triggers, request.actions)
        .await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

#[utoipa::path(
    get,
    path = "/workflows",
    tag = "workflows",
    responses((status = 200, description = "All workflows"))
)]
pub async fn list_workflows(State(state): State<AppState>) -> ApiResult<Json<Vec<Workflow>>> {
    Ok(Json(state.manager.list_workflows().await?))
}

#[utoipa::path(
    get,
    path = "/workflows/{id}",
    tag = "workflows",
    responses(
        (status = 200, description = "The workflow"),
        (status = 404, description = "Unknown workflow"),
    )
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.manager.get_workflow(id).await?))
}

#[utoipa::path(
    patch,
    path = "/workflows/{id}",
    tag = "workflows",
    request_body(content = String, description = "Partial workflow update"),
    responses(
        (status = 200, description = "Updated workflow"),
        (status = 404, description = "Unknown workflow"),
    )
)]
pub async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<WorkflowPatch>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.manager.update_workflow(id, patch).await?))
}

#[utoipa::path(
    delete,
    path = "/workflows/{id}",
    tag = "workflows",
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Unknown workflow"),
    )
)]
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.manager.delete_workflow(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/execute",
    tag = "workflows",
    request_body(content = String, description = "Manual execution request"),
    responses(
        (status = 200, description = "The completed run"),
        (status = 409, description = "A run is already in flight"),
    )
)]
pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<watchflow_core::model::Run>> {
    let run = state
        .manager
        .execute(id, RunTrigger::Manual, request.triggered_by, request.data)
        .await?;
    Ok(Json(run))
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/pause",
    tag = "workflows",
    responses((status = 200, description = "Paused workflow"))
)]
pub async fn pause_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.manager.pause(id).await?))
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/resume",
    tag = "workflows",
    responses((status = 200, description = "Resumed workflow"))
)]
pub async fn resume_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.manager.resume(id).await?))
}

#[utoipa::path(
    get,
    path = "/workflows/{id}/runs",
    tag = "workflows",
    params(ListRunsParams),
    responses((status = 200, description = "Runs for the workflow, newest first"))
)]
pub async fn list_workflow_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ListRunsParams>,
) -> ApiResult<Json<Vec<watchflow_core::model::Run>>> {
    let mut filter = RunFilter::for_workflow(id);
    if let Some(status) = params.status.as_deref() {
        let status: RunStatus = status
            .parse()
            .map_err(|e: String| ApiError(watchflow_engine::EngineError::validation(e)))?;
        filter = filter.with_status(status);
    }
    if let Some(limit) = params.limit {
        filter = filter.with_limit(limit);
    }
    Ok(Json(state.manager.list_runs(filter).await?))
}

#[utoipa::path(
    get,
    path = "/workflows/{id}/conflicts",
    tag = "workflows",
    params(ConflictParams),
    responses((status = 200, description = "Schedule conflicts within the range"))
)]
pub async fn workflow_conflicts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ConflictParams>,
) -> ApiResult<Json<Value>> {
    let range = params
        .hours
        .map(|h| std::time::Duration::from_secs(h * 3600));
    let conflicts = state.manager.detect_conflicts(id, range);
    Ok(Json(json!({ "conflicts": conflicts })))
}

#[utoipa::path(
    get,
    path = "/stats",
    tag = "stats",
    responses((status = 200, description = "Global stats"))
)]
pub async fn global_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(state.manager.stats(None).await?))
}

#[utoipa::path(
    get,
    path = "/workflows/{id}/stats",
    tag = "stats",
    responses((status = 200, description = "Per-workflow stats"))
)]
pub async fn workflow_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.manager.stats(Some(id)).await?))
}
