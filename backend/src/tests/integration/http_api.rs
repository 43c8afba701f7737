use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use crate::events::EventBus;
use crate::tests::helpers::TestHarness;
use crate::{router, AppState};

fn app(harness: &TestHarness) -> Router {
    router(Arc::new(AppState {
        engine: harness.engine(),
        bus: Arc::new(harness.bus(EventBus::builder())),
        pool: None,
    }))
}

async fn send(app: &Router, method: &str, uri: &str, tenant_id: Option<Uuid>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(tenant_id) = tenant_id {
        request = request.header("X-Tenant-Id", tenant_id.to_string());
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn create_body() -> Value {
    json!({
        "name": "New deal alert",
        "trigger_type": "entity_created",
        "entity_type": "Deal",
        "trigger_conditions": "",
        "is_active": true,
        "steps": [
            { "name": "Notify owner", "action_type": "send_notification", "action_configuration": "{\"message\": \"{{title}}\"}" }
        ]
    })
}

#[tokio::test]
async fn test_health() {
    let harness = TestHarness::new();
    let (status, body) = send(&app(&harness), "GET", "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_tenant_header_is_required() {
    let harness = TestHarness::new();
    let (status, body) = send(&app(&harness), "POST", "/api/v1/workflows", None, Some(create_body())).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_workflow_lifecycle_over_http() {
    let harness = TestHarness::new();
    let app = app(&harness);
    let tenant_id = Uuid::new_v4();

    let (status, created) = send(&app, "POST", "/api/v1/workflows", Some(tenant_id), Some(create_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, workflow) = send(&app, "GET", &format!("/api/v1/workflows/{}", id), Some(tenant_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(workflow["name"], "New deal alert");
    assert_eq!(workflow["is_active"], true);

    let (status, _) = send(&app, "GET", &format!("/api/v1/workflows/{}", id), Some(Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, started) = send(
        &app,
        "POST",
        &format!("/api/v1/workflows/{}/execute", id),
        Some(tenant_id),
        Some(json!({ "parameters": { "title": "Deal #7" } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(started["execution_id"].is_string());

    let (status, executions) =
        send(&app, "GET", &format!("/api/v1/workflows/{}/executions", id), Some(tenant_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(executions.as_array().unwrap().len(), 1);
    assert_eq!(executions[0]["status"], "completed");
    assert_eq!(harness.capability.requests()[0].configuration["message"], "Deal #7");

    let (status, dead) = send(&app, "GET", "/api/v1/dead-letters", Some(tenant_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dead, json!([]));
}

#[tokio::test]
async fn test_validation_errors_are_unprocessable() {
    let harness = TestHarness::new();
    let mut body = create_body();
    body["steps"] = json!([]);

    let (status, error) = send(&app(&harness), "POST", "/api/v1/workflows", Some(Uuid::new_v4()), Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error["code"], "Workflow.NoSteps");
}

#[tokio::test]
async fn test_repeated_idempotency_key_conflicts() {
    let harness = TestHarness::new();
    let app = app(&harness);
    let tenant_id = Uuid::new_v4();

    let request = || {
        Request::builder()
            .method("POST")
            .uri("/api/v1/workflows")
            .header("X-Tenant-Id", tenant_id.to_string())
            .header("Idempotency-Key", "wf-create-1")
            .header("content-type", "application/json")
            .body(Body::from(create_body().to_string()))
            .unwrap()
    };

    let first = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let second = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_oversized_idempotency_key_is_bad_request() {
    let harness = TestHarness::new();
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/workflows")
        .header("X-Tenant-Id", Uuid::new_v4().to_string())
        .header("Idempotency-Key", "k".repeat(300))
        .header("content-type", "application/json")
        .body(Body::from(create_body().to_string()))
        .unwrap();

    let response = app(&harness).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(harness.workflows.count().await, 0);
    assert_eq!(harness.ledger.len().await, 0);
}
