// Watchflow API: REST surface, webhook ingress, WebSocket fan-out

mod changes;
mod common;
mod runs;
mod webhook;
mod workflows;
mod ws;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use watchflow_engine::Manager;

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub manager: Manager,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health(State(_state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        workflows::create_workflow,
        workflows::list_workflows,
        workflows::get_workflow,
        workflows::update_workflow,
        workflows::delete_workflow,
        workflows::execute_workflow,
        workflows::pause_workflow,
        workflows::resume_workflow,
        workflows::list_workflow_runs,
        workflows::workflow_conflicts,
        workflows::global_stats,
        workflows::workflow_stats,
        runs::list_runs,
        runs::get_run,
        runs::cancel_run,
        changes::list_changes,
        changes::acknowledge_change,
        webhook::ingress,
    ),
    tags(
        (name = "workflows", description = "Workflow lifecycle and execution"),
        (name = "runs", description = "Run inspection and cancellation"),
        (name = "changes", description = "Detected page changes"),
        (name = "webhooks", description = "External trigger ingress"),
        (name = "stats", description = "Metrics summaries"),
    ),
    info(
        title = "Watchflow API",
        description = "Watched-workflow automation engine",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

/// Assemble the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/workflows",
            post(workflows::create_workflow).get(workflows::list_workflows),
        )
        .route(
            "/workflows/:id",
            get(workflows::get_workflow)
                .patch(workflows::update_workflow)
                .delete(workflows::delete_workflow),
        )
        .route("/workflows/:id/execute", post(workflows::execute_workflow))
        .route("/workflows/:id/pause", post(workflows::pause_workflow))
        .route("/workflows/:id/resume", post(workflows::resume_workflow))
        .route("/workflows/:id/runs", get(workflows::list_workflow_runs))
        .route("/workflows/:id/conflicts", get(workflows::workflow_conflicts))
        .route("/workflows/:id/stats", get(workflows::workflow_stats))
        .route("/workflows/webhook/:token", post(webhook::ingress))
        .route("/runs", get(runs::list_runs))
        .route("/runs/:id", get(runs::get_run))
        .route("/runs/:id/cancel", post(runs::cancel_run))
        .route(
            "/changes",
            get(changes::list_changes),
        )
        .route("/changes/:id/ack", post(changes::acknowledge_change))
        .route("/stats", get(workflows::global_stats))
        .route("/ws", get(ws::ws_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
