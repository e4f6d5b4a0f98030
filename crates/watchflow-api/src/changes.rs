//! Change endpoints

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use watchflow_core::model::{Change, ChangeKind, ChangeSeverity};
use watchflow_storage::ChangeFilter;

use crate::common::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListChangesParams {
    pub workflow_id: Option<Uuid>,
    pub kind: Option<String>,
    pub severity: Option<String>,
    pub acknowledged: Option<bool>,
    pub limit: Option<usize>,
}

#[utoipa::path(
    get,
    path = "/changes",
    tag = "changes",
    params(ListChangesParams),
    responses((status = 200, description = "Detected changes, newest first"))
)]
pub async fn list_changes(
    State(state): State<AppState>,
    Query(params): Query<ListChangesParams>,
) -> ApiResult<Json<Vec<Change>>> {
    let mut filter = ChangeFilter {
        workflow_id: params.workflow_id,
        acknowledged: params.acknowledged,
        limit: params.limit,
        ..Default::default()
    };
    if let Some(kind) = params.kind.as_deref() {
        let kind: ChangeKind = kind
            .parse()
            .map_err(|e: String| ApiError(watchflow_engine::EngineError::validation(e)))?;
        filter.kind = Some(kind);
    }
    if let Some(severity) = params.severity.as_deref() {
        let severity: ChangeSeverity = severity
            .parse()
            .map_err(|e: String| ApiError(watchflow_engine::EngineError::validation(e)))?;
        filter.severity = Some(severity);
    }
    Ok(Json(state.manager.list_changes(filter).await?))
}

#[utoipa::path(
    post,
    path = "/changes/{id}/ack",
    tag = "changes",
    responses(
        (status = 200, description = "Acknowledged change"),
        (status = 404, description = "Unknown change"),
    )
)]
pub async fn acknowledge_change(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Change>> {
    Ok(Json(state.manager.acknowledge_change(id).await?))
}
