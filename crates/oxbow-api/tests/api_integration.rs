//! In-process HTTP tests for the API surface: submission, idempotency
//! conflicts, webhook intake, auth, and health.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use oxbow_api::config::Config;
use oxbow_api::server::{router, AppState};
use oxbow_core::WebhookSigner;
use oxbow_flow::apikey::{ApiKey, ApiKeyRole};
use oxbow_flow::store::Store;

const WEBHOOK_SECRET: &str = "test-webhook-secret";

fn debug_app() -> (Router, AppState) {
    let config = Config {
        debug: true,
        webhook_secret: WEBHOOK_SECRET.to_string(),
        api_key_salt: "test-salt".to_string(),
        ..Config::default()
    };
    let state = AppState::new(config);
    (router(state.clone()), state)
}

fn authed_app() -> (Router, AppState) {
    let config = Config {
        debug: false,
        webhook_secret: WEBHOOK_SECRET.to_string(),
        api_key_salt: "test-salt".to_string(),
        ..Config::default()
    };
    let state = AppState::new(config);
    (router(state.clone()), state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn submit_then_get_round_trip() {
    let (app, _state) = debug_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/tasks",
            json!({"type": "gen_content", "payload": {"prompt": "hello"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    assert_eq!(body["status"], "queued");
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let response = app.oneshot(get(&format!("/tasks/{task_id}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["id"], task_id.as_str());
    assert_eq!(body["type"], "gen_content");
    assert_eq!(body["status"], "queued");
    assert_eq!(body["retry_count"], 0);
}

#[tokio::test]
async fn duplicate_idempotency_key_returns_conflict_with_existing_id() {
    let (app, _state) = debug_app();

    let request = json!({
        "type": "gen_content",
        "payload": {"prompt": "dedup"},
        "idempotency_key": "k1",
    });

    let first = app.clone().oneshot(post_json("/tasks", request.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first_id = body_json(first).await["task_id"].as_str().unwrap().to_string();

    let second = app.oneshot(post_json("/tasks", request)).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let second_id = body_json(second).await["task_id"].as_str().unwrap().to_string();

    assert_eq!(first_id, second_id);
}

#[tokio::test]
async fn unknown_task_returns_not_found() {
    let (app, _state) = debug_app();

    let response = app
        .oneshot(get("/tasks/7c9e6679-7425-40de-944b-e07fc1f90ae7"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_json(response).await;
    assert_eq!(body["code"], "not_found");
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

fn webhook_request(
    source: &str,
    external_id: &str,
    body: &str,
    timestamp: &str,
    signature: &str,
) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{source}"))
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-signature", signature)
        .header("x-timestamp", timestamp)
        .header("x-event-id", external_id)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn webhook_accept_then_replay() {
    let (app, _state) = debug_app();
    let signer = WebhookSigner::new(WEBHOOK_SECRET);

    let body = json!({"type": "gen_content", "payload": {"prompt": "hi"}}).to_string();
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let signature = signer.compute(body.as_bytes(), Some(&timestamp)).unwrap();

    let first = app
        .clone()
        .oneshot(webhook_request("github", "delivery-1", &body, &timestamp, &signature))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let accepted = body_json(first).await;
    assert_eq!(accepted["status"], "accepted");
    assert!(accepted["task_id"].is_string());

    // Same delivery again: replay blocked.
    let second = app
        .oneshot(webhook_request("github", "delivery-1", &body, &timestamp, &signature))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(second).await["code"], "replay_blocked");
}

#[tokio::test]
async fn webhook_invalid_signature_is_unauthorized() {
    let (app, _state) = debug_app();

    let body = json!({"type": "gen_content", "payload": {}}).to_string();
    let timestamp = chrono::Utc::now().timestamp().to_string();

    let response = app
        .oneshot(webhook_request(
            "github",
            "delivery-2",
            &body,
            &timestamp,
            "sha256=deadbeef",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "invalid_signature");
}

#[tokio::test]
async fn webhook_stale_timestamp_is_request_timeout() {
    let (app, _state) = debug_app();
    let signer = WebhookSigner::new(WEBHOOK_SECRET);

    let body = json!({"type": "gen_content", "payload": {}}).to_string();
    let stale = (chrono::Utc::now().timestamp() - 3600).to_string();
    let signature = signer.compute(body.as_bytes(), Some(&stale)).unwrap();

    let response = app
        .oneshot(webhook_request("github", "delivery-3", &body, &stale, &signature))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body_json(response).await["code"], "replay_window_exceeded");
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

async fn insert_key(state: &AppState, raw_key: &str, role: ApiKeyRole) {
    let key = ApiKey::new(state.hasher.hash(raw_key), "test-key", role, None);
    state.store.insert_api_key(key).await.unwrap();
}

#[tokio::test]
async fn missing_auth_is_rejected_outside_debug() {
    let (app, _state) = authed_app();

    let response = app
        .oneshot(post_json("/tasks", json!({"type": "gen_content", "payload": {}})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn service_key_can_submit_but_not_administer() {
    let (app, state) = authed_app();
    insert_key(&state, "raw-service-key", ApiKeyRole::Service).await;

    let mut request = post_json("/tasks", json!({"type": "gen_content", "payload": {}}));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer raw-service-key".parse().unwrap(),
    );
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let mut request = get("/admin/runs");
    request.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer raw-service-key".parse().unwrap(),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn revoked_key_is_rejected() {
    let (app, state) = authed_app();
    let key = ApiKey::new(
        state.hasher.hash("raw-revoked-key"),
        "revoked",
        ApiKeyRole::Service,
        None,
    );
    let id = key.id;
    state.store.insert_api_key(key).await.unwrap();
    state.store.set_api_key_active(&id, false).await.unwrap();

    let mut request = post_json("/tasks", json!({"type": "gen_content", "payload": {}}));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer raw-revoked-key".parse().unwrap(),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ---------------------------------------------------------------------------
// Admin surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn admin_key_lifecycle() {
    let (app, _state) = debug_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/admin/keys",
            json!({"name": "ci", "role": "service", "expires_in_days": 30}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let created = body_json(response).await;
    let raw_key = created["raw_key"].as_str().unwrap();
    assert!(raw_key.starts_with("oxb_"));
    let key_id = created["id"].as_str().unwrap().to_string();

    // Listing never exposes hashes or raw keys.
    let response = app.clone().oneshot(get("/admin/keys")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    let rendered = listed.to_string();
    assert!(!rendered.contains(raw_key));
    assert!(!rendered.contains("key_hash"));

    // Rotate: a new key arrives, the old one gets an overlap expiry.
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/admin/keys/{key_id}/rotate"),
            json!({"overlap_minutes": 5}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let rotated = body_json(response).await;
    assert_ne!(rotated["id"], key_id.as_str());
    assert_eq!(rotated["name"], "ci-rotated");

    // Revoke the original.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/admin/keys/{key_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn drain_without_body_uses_documented_defaults() {
    use oxbow_flow::broker::{DlqEntry, QueueBroker};
    use oxbow_flow::run::RunStatus;
    use oxbow_flow::task::{Task, TaskKind, TaskRequest, TaskStatus};

    let (app, state) = debug_app();

    // Seed one dead-lettered task.
    let task = Task::from_request(TaskRequest::new(TaskKind::GenContent, json!({})), 3);
    let task = state.store.create_task(task).await.unwrap().into_task();
    let run = state
        .store
        .begin_attempt(&task.id, chrono::Utc::now())
        .await
        .unwrap();
    let task = state
        .store
        .dead_letter(&task.id, &run.id, RunStatus::Failed, "HTTP 503")
        .await
        .unwrap();
    state
        .broker
        .push_dlq(DlqEntry {
            task_id: task.id,
            kind: task.kind,
            priority: task.priority,
            retry_count: task.retry_count,
            last_error: task.last_error.clone(),
            moved_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    // No JSON body at all: the documented defaults (max 100, demote)
    // must apply.
    let request = Request::builder()
        .method("POST")
        .uri("/admin/dlq/gen_content/drain")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["drained"], 1);
    assert_eq!(body["skipped"], 0);

    let revived = state.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(revived.status, TaskStatus::Queued);
    assert_eq!(revived.retry_count, 0);
}

#[tokio::test]
async fn admin_circuits_and_budgets_are_queryable() {
    let (app, state) = debug_app();

    state.circuits.record_failure("anthropic").await.unwrap();
    state
        .budget
        .commit(oxbow_flow::task::Provider::Anthropic, 0.25, 500)
        .await
        .unwrap();

    let response = app.clone().oneshot(get("/admin/circuits")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let circuits = body_json(response).await;
    assert_eq!(circuits[0]["service"], "anthropic");

    let response = app.oneshot(get("/admin/budgets")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let budgets = body_json(response).await;
    assert_eq!(budgets[0]["provider"], "anthropic");
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_is_ok_with_reachable_backends() {
    let (app, _state) = debug_app();

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["store"], true);
    assert_eq!(body["checks"]["broker"], true);
}
