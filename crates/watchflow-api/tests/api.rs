//! HTTP surface tests over the assembled router

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use watchflow_api::{build_router, AppState};
use watchflow_core::browser::{PageFixture, StubBrowser};
use watchflow_core::bus::EventBus;
use watchflow_core::model::RateLimitConfig;
use watchflow_core::outbound::{
    RecordingEmailSender, RecordingSmsSender, RecordingVcsProvider, StubAgentDispatcher,
};
use watchflow_engine::{sign_body, Manager, ManagerConfig, OutboundAdapters};
use watchflow_storage::InMemoryRepository;

struct TestApp {
    router: axum::Router,
    browser: StubBrowser,
    manager: Manager,
}

async fn test_app() -> TestApp {
    let bus = EventBus::default();
    let repo = Arc::new(InMemoryRepository::new(bus.clone()));
    let browser = StubBrowser::new();
    let adapters = OutboundAdapters {
        agent: Arc::new(StubAgentDispatcher::new()),
        email: Arc::new(RecordingEmailSender::new()),
        sms: Arc::new(RecordingSmsSender::new()),
        vcs: Arc::new(RecordingVcsProvider::new()),
    };
    let manager = Manager::new(
        repo,
        Arc::new(browser.clone()),
        adapters,
        bus,
        ManagerConfig::default(),
    );
    manager.start().await.expect("manager should start");

    TestApp {
        router: build_router(AppState {
            manager: manager.clone(),
        }),
        browser,
        manager,
    }
}

async fn request(router: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(req)
        .await
        .expect("request should complete");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should read")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

fn workflow_body(name: &str) -> Value {
    json!({
        "name": name,
        "status": "draft",
        "playbook": [
            {"id": "open", "kind": "navigate", "config": {"url": "https://example.test"}},
            {"id": "grab", "kind": "extract", "config": {"title": "h1"},
             "dependencies": ["open"]}
        ]
    })
}

#[tokio::test]
async fn test_health() {
    let app = test_app().await;
    let (status, body) = request(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    app.manager.shutdown();
}

#[tokio::test]
async fn test_workflow_crud_and_execute() {
    let app = test_app().await;
    app.browser.set_page(
        "https://example.test",
        PageFixture::with_text("page").selector("h1", "A"),
    );

    let (status, created) =
        request(&app.router, post_json("/workflows", workflow_body("api-test"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().expect("id").to_string();

    let (status, fetched) = request(&app.router, get(&format!("/workflows/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "api-test");

    let (status, run) = request(
        &app.router,
        post_json(&format!("/workflows/{id}/execute"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "success");
    assert_eq!(run["extracted_data"]["title"], "A");

    let (status, runs) = request(&app.router, get(&format!("/workflows/{id}/runs"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs.as_array().expect("array").len(), 1);

    let (status, _) = request(
        &app.router,
        Request::builder()
            .method("DELETE")
            .uri(format!("/workflows/{id}"))
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = request(&app.router, get(&format!("/workflows/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    app.manager.shutdown();
}

#[tokio::test]
async fn test_unknown_workflow_is_404() {
    let app = test_app().await;
    let (status, _) = request(
        &app.router,
        get("/workflows/00000000-0000-7000-8000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    app.manager.shutdown();
}

#[tokio::test]
async fn test_webhook_status_codes() {
    let app = test_app().await;
    app.browser.set_page(
        "https://example.test",
        PageFixture::with_text("page").selector("h1", "A"),
    );

    let mut body = workflow_body("hooked");
    body["status"] = json!("active");
    body["triggers"] = json!([
        {"kind": "webhook", "token": "tok-api", "secret": "s3cr3t"}
    ]);
    body["rate_limit"] = serde_json::to_value(RateLimitConfig {
        capacity: 3,
        window_ms: 60_000,
    })
    .expect("serialize");

    let (status, _) = request(&app.router, post_json("/workflows", body)).await;
    assert_eq!(status, StatusCode::CREATED);

    let payload = br#"{"x":1}"#;
    let signature = sign_body("s3cr3t", payload);

    // Valid signature: accepted and queued
    let signed = Request::builder()
        .method("POST")
        .uri("/workflows/webhook/tok-api")
        .header("content-type", "application/json")
        .header("x-webhook-signature", &signature)
        .body(Body::from(&payload[..]))
        .expect("request");
    let (status, accepted) = request(&app.router, signed).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "accepted");

    // Wrong signature: 401
    let bad = Request::builder()
        .method("POST")
        .uri("/workflows/webhook/tok-api")
        .header("x-webhook-signature", "sha256=deadbeef")
        .body(Body::from(&payload[..]))
        .expect("request");
    let (status, _) = request(&app.router, bad).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Unknown token: 400
    let unknown = Request::builder()
        .method("POST")
        .uri("/workflows/webhook/nope")
        .header("x-webhook-signature", &signature)
        .body(Body::from(&payload[..]))
        .expect("request");
    let (status, _) = request(&app.router, unknown).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Flood past the limit: 429 once the bucket is empty
    let mut saw_rate_limit = false;
    for _ in 0..5 {
        let signed = Request::builder()
            .method("POST")
            .uri("/workflows/webhook/tok-api")
            .header("x-webhook-signature", &signature)
            .body(Body::from(&payload[..]))
            .expect("request");
        let (status, _) = request(&app.router, signed).await;
        if status == StatusCode::TOO_MANY_REQUESTS {
            saw_rate_limit = true;
        }
    }
    assert!(saw_rate_limit);
    app.manager.shutdown();
}

#[tokio::test]
async fn test_stats_endpoints() {
    let app = test_app().await;
    let (status, stats) = request(&app.router, get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["workflows"], 0);
    app.manager.shutdown();
}

#[tokio::test]
async fn test_pause_resume_endpoints() {
    let app = test_app().await;
    app.browser.set_page(
        "https://example.test",
        PageFixture::with_text("page").selector("h1", "A"),
    );

    let mut body = workflow_body("toggled");
    body["status"] = json!("active");
    let (_, created) = request(&app.router, post_json("/workflows", body)).await;
    let id = created["id"].as_str().expect("id").to_string();

    let (status, paused) = request(
        &app.router,
        post_json(&format!("/workflows/{id}/pause"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["status"], "paused");

    let (status, resumed) = request(
        &app.router,
        post_json(&format!("/workflows/{id}/resume"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["status"], "active");
    app.manager.shutdown();
}
