// Watchflow API server
//
// Storage is selected by environment: DATABASE_URL connects Postgres,
// otherwise the in-memory repository serves development and tests. The
// browser engine, agent orchestrator, and notification providers are
// external collaborators; the bundled stubs stand in until real adapters
// are wired at this composition point.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use watchflow_api::{build_router, AppState};
use watchflow_core::browser::StubBrowser;
use watchflow_core::bus::EventBus;
use watchflow_core::outbound::{
    RecordingEmailSender, RecordingSmsSender, RecordingVcsProvider, StubAgentDispatcher,
};
use watchflow_engine::{Manager, ManagerConfig, OutboundAdapters, TriggerRouterConfig};
use watchflow_storage::{InMemoryRepository, PostgresRepository, Repository};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,watchflow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let bus = EventBus::default();

    let repo: Arc<dyn Repository> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            tracing::info!("using postgres storage");
            Arc::new(
                PostgresRepository::connect(&url, bus.clone())
                    .await
                    .context("failed to connect to postgres")?,
            )
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage");
            Arc::new(InMemoryRepository::new(bus.clone()))
        }
    };

    let public_url =
        std::env::var("PUBLIC_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let config = ManagerConfig {
        router: TriggerRouterConfig {
            public_url,
            ..Default::default()
        },
        ..Default::default()
    };

    let adapters = OutboundAdapters {
        agent: Arc::new(StubAgentDispatcher::new()),
        email: Arc::new(RecordingEmailSender::new()),
        sms: Arc::new(RecordingSmsSender::new()),
        vcs: Arc::new(RecordingVcsProvider::new()),
    };

    let manager = Manager::new(
        repo,
        Arc::new(StubBrowser::new()),
        adapters,
        bus,
        config,
    );
    manager
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("manager failed to start: {e}"))?;

    let app = build_router(AppState {
        manager: manager.clone(),
    });

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "watchflow api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            manager.shutdown();
        })
        .await
        .context("server error")?;

    Ok(())
}
