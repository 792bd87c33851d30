//! The `proctor serve` ingress: push webhook with HMAC validation plus the
//! REST surface for submitting, canceling, and inspecting executions. Runs
//! alongside the router and the full agent fleet in one process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use proctor_core::bus::PriorityBus;
use proctor_core::db::Database;
use proctor_core::message::{
    AgentIdentity, AgentType, ExecutionRequest, Message, MessagePayload, Priority,
    TestGenerationRequest,
};

use crate::config::ProctorConfig;
use crate::wiring::{Fleet, build_fleet, select_database};

type HmacSha256 = Hmac<Sha256>;

/// File extensions treated as UI changes by the webhook heuristic.
const UI_EXTENSIONS: [&str; 9] = [
    "html", "css", "scss", "js", "jsx", "ts", "tsx", "vue", "svelte",
];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State and payloads
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<PriorityBus>,
    pub db: Arc<dyn Database>,
    pub webhook_secret: Option<String>,
    pub identity: AgentIdentity,
}

#[derive(Debug, Deserialize)]
struct PushCommit {
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    modified: Vec<String>,
    #[serde(default)]
    removed: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct PushHeadCommit {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    repository: PushRepository,
    #[serde(rename = "ref")]
    git_ref: String,
    head_commit: Option<PushHeadCommit>,
    #[serde(default)]
    commits: Vec<PushCommit>,
    #[serde(default)]
    compare: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub test_file_path: Option<String>,
    #[serde(default)]
    pub grep: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    execution_id: String,
}

// ---------------------------------------------------------------------------
// Webhook helpers
// ---------------------------------------------------------------------------

/// Verify an `X-Hub-Signature-256` header (`sha256=<hex>`) against the raw
/// request body using constant-time HMAC comparison.
pub fn verify_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Collect every path touched by the push.
fn changed_files(payload: &PushPayload) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for commit in &payload.commits {
        for path in commit
            .added
            .iter()
            .chain(&commit.modified)
            .chain(&commit.removed)
        {
            if !files.contains(path) {
                files.push(path.clone());
            }
        }
    }
    files
}

/// Extension-based heuristic: did this push touch the UI?
pub fn ui_changed(files: &[String]) -> bool {
    files.iter().any(|file| {
        std::path::Path::new(file)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| UI_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    })
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_http_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/webhook/push", post(webhook_push))
        .route("/api/executions", post(submit_execution))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/stats", get(stats))
        .route("/api/admin/reset", post(admin_reset))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    config: &ProctorConfig,
    bind: &str,
    port: u16,
    memory_db: bool,
) -> Result<()> {
    let db = select_database(config, memory_db).await?;
    let Fleet {
        bus, router, db, ..
    } = build_fleet(&config.core, db);

    router.initialize_all().await?;

    let cancel = CancellationToken::new();
    let worker = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = router.run(cancel).await;
            router.shutdown_all().await;
            result
        })
    };

    let state = AppState {
        bus: Arc::clone(&bus),
        db,
        webhook_secret: config.webhook_secret.clone(),
        identity: AgentIdentity::local(AgentType::Writer),
    };
    let app = build_http_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("proctor serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("ingress stopped, draining workers");
    cancel.cancel();
    worker.await??;
    tracing::info!("proctor serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let stats = state.bus.stats().await.map_err(|e| AppError::internal(e.into()))?;
    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>proctor</title></head><body>\
<h1>proctor</h1>\
<p><a href=\"/api/stats\">/api/stats</a></p>\
<table><tr><th>Queue</th><th>Depth</th></tr>\
<tr><td>default</td><td>{}</td></tr>\
<tr><td>high</td><td>{}</td></tr>\
<tr><td>critical</td><td>{}</td></tr>\
<tr><td>dlq</td><td>{}</td></tr></table>\
</body></html>",
        stats.default, stats.high, stats.critical, stats.dlq,
    );
    Ok(Html(html).into_response())
}

async fn webhook_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    let Some(secret) = &state.webhook_secret else {
        return Err(AppError::unauthorized("webhook secret not configured"));
    };
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing X-Hub-Signature-256"))?;
    if !verify_signature(secret, &body, signature) {
        return Err(AppError::unauthorized("signature mismatch"));
    }

    let payload: PushPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid push payload: {e}")))?;

    let files = changed_files(&payload);
    if !ui_changed(&files) {
        return Ok(Json(serde_json::json!({
            "enqueued": false,
            "ui_changed": false,
        }))
        .into_response());
    }

    let branch = payload
        .git_ref
        .strip_prefix("refs/heads/")
        .unwrap_or(&payload.git_ref)
        .to_string();
    let message = Message::new(
        state.identity.clone(),
        AgentType::Writer,
        MessagePayload::TestGenerationRequest(TestGenerationRequest {
            repo: payload.repository.full_name,
            branch,
            head_commit: payload
                .head_commit
                .map(|c| c.id)
                .unwrap_or_default(),
            changed_files: files,
            compare_url: payload.compare,
        }),
    );
    let message_id = message.id;
    state
        .bus
        .send(message)
        .await
        .map_err(|e| AppError::internal(e.into()))?;

    Ok(Json(serde_json::json!({
        "enqueued": true,
        "ui_changed": true,
        "message_id": message_id,
    }))
    .into_response())
}

async fn submit_execution(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<axum::response::Response, AppError> {
    let execution_id = format!("exec-{}", Uuid::new_v4().simple());
    state
        .bus
        .send(
            Message::new(
                state.identity.clone(),
                AgentType::Executor,
                MessagePayload::ExecutionRequest(ExecutionRequest {
                    execution_id: Some(execution_id.clone()),
                    test_file_path: request.test_file_path,
                    grep: request.grep,
                    ..Default::default()
                }),
            )
            .with_priority(Priority::High),
        )
        .await
        .map_err(|e| AppError::internal(e.into()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse { execution_id }),
    )
        .into_response())
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    state
        .bus
        .send(
            Message::new(
                state.identity.clone(),
                AgentType::Executor,
                MessagePayload::ExecutionCancel { execution_id: id },
            )
            .with_priority(Priority::Critical),
        )
        .await
        .map_err(|e| AppError::internal(e.into()))?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({"canceled": true}))).into_response())
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let execution = state
        .db
        .get_execution(&id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("execution {id} not found")))?;
    Ok(Json(execution).into_response())
}

async fn stats(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let queues = state.bus.stats().await.map_err(|e| AppError::internal(e.into()))?;
    let metrics = state.bus.metrics();
    Ok(Json(serde_json::json!({
        "queues": queues,
        "metrics": metrics,
    }))
    .into_response())
}

async fn admin_reset(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let summary = state
        .bus
        .reset_all()
        .await
        .map_err(|e| AppError::internal(e.into()))?;
    Ok(Json(summary).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use proctor_core::bus::store::MemoryStore;
    use proctor_core::bus::BusConfig;
    use proctor_core::db::MemoryDatabase;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "test-webhook-secret";

    fn test_state() -> (AppState, Arc<PriorityBus>) {
        let bus = Arc::new(PriorityBus::new(
            Arc::new(MemoryStore::new()),
            BusConfig::default(),
        ));
        let state = AppState {
            bus: Arc::clone(&bus),
            db: Arc::new(MemoryDatabase::new()),
            webhook_secret: Some(SECRET.to_string()),
            identity: AgentIdentity::local(AgentType::Writer),
        };
        (state, bus)
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn push_body(files: &[&str]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "ref": "refs/heads/main",
            "repository": {"full_name": "acme/storefront"},
            "head_commit": {"id": "feedface1234"},
            "commits": [{"added": files, "modified": [], "removed": []}],
            "compare": "https://example.test/compare/a...b",
        }))
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn signature_verification_round_trip() {
        let body = b"payload";
        let header = sign(body);
        assert!(verify_signature(SECRET, body, &header));
        assert!(!verify_signature(SECRET, b"tampered", &header));
        assert!(!verify_signature("other-secret", body, &header));
        assert!(!verify_signature(SECRET, body, "sha256=zz"));
        assert!(!verify_signature(SECRET, body, "md5=abc"));
    }

    #[test]
    fn ui_change_heuristic() {
        assert!(ui_changed(&["src/Header.tsx".to_string()]));
        assert!(ui_changed(&["styles/app.CSS".to_string()]));
        assert!(!ui_changed(&["README.md".to_string()]));
        assert!(!ui_changed(&["server/main.rs".to_string()]));
        assert!(!ui_changed(&[]));
    }

    #[tokio::test]
    async fn signed_ui_push_enqueues_a_generation_request() {
        let (state, bus) = test_state();
        let app = build_http_router(state);

        let body = push_body(&["src/Header.tsx"]);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/push")
                    .header("x-hub-signature-256", sign(&body))
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["enqueued"], true);

        let delivery = bus
            .consume_next(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.kind(), "TEST_GENERATION_REQUEST");
        match &delivery.message.payload {
            MessagePayload::TestGenerationRequest(req) => {
                assert_eq!(req.repo, "acme/storefront");
                assert_eq!(req.branch, "main");
                assert_eq!(req.head_commit, "feedface1234");
                assert_eq!(req.changed_files, vec!["src/Header.tsx".to_string()]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let (state, bus) = test_state();
        let app = build_http_router(state);

        let body = push_body(&["src/Header.tsx"]);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/push")
                    .header("x-hub-signature-256", "sha256=0000")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(bus
            .consume_next(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn non_ui_push_is_acknowledged_without_enqueueing() {
        let (state, bus) = test_state();
        let app = build_http_router(state);

        let body = push_body(&["docs/README.md"]);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/push")
                    .header("x-hub-signature-256", sign(&body))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ui_changed"], false);
        assert!(bus
            .consume_next(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn submit_and_cancel_ride_the_priority_queues() {
        let (state, bus) = test_state();
        let app = build_http_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/executions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"grep": "checkout"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        let execution_id = json["execution_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/executions/{execution_id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // The cancel (critical) outranks the submit (high).
        let first = bus
            .consume_next(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.message.kind(), "EXECUTION_CANCEL");
        let second = bus
            .consume_next(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message.kind(), "EXECUTION_REQUEST");
    }

    #[tokio::test]
    async fn missing_execution_is_a_404() {
        let (state, _bus) = test_state();
        let app = build_http_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/executions/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_exposes_queue_depths_and_metrics() {
        let (state, _bus) = test_state();
        let app = build_http_router(state);

        let response = app
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["queues"].get("dlq").is_some());
        assert!(json["metrics"].get("enqueued").is_some());
    }
}
