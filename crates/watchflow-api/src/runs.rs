//! Run endpoints

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use watchflow_core::model::{Run, RunStatus};
use watchflow_storage::RunFilter;

use crate::common::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListRunsParams {
    pub workflow_id: Option<Uuid>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[utoipa::path(
    get,
    path = "/runs",
    tag = "runs",
    params(ListRunsParams),
    responses((status = 200, description = "Runs, newest first"))
)]
pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsParams>,
) -> ApiResult<Json<Vec<Run>>> {
    let mut filter = RunFilter {
        workflow_id: params.workflow_id,
        limit: params.limit,
        ..Default::default()
    };
    if let Some(status) = params.status.as_deref() {
        let status: RunStatus = status
            .parse()
            .map_err(|e: String| ApiError(watchflow_engine::EngineError::validation(e)))?;
        filter.status = Some(status);
    }
    Ok(Json(state.manager.list_runs(filter).await?))
}

#[utoipa::path(
    get,
    path = "/runs/{id}",
    tag = "runs",
    responses(
        (status = 200, description = "The run"),
        (status = 404, description = "Unknown run"),
    )
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Run>> {
    Ok(Json(state.manager.get_run(id).await?))
}

#[utoipa::path(
    post,
    path = "/runs/{id}/cancel",
    tag = "runs",
    responses(
        (status = 202, description = "Cancellation requested"),
        (status = 409, description = "Run already terminal"),
    )
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.manager.cancel(id).await?;
    Ok(StatusCode::ACCEPTED)
}
