//! Boundary HTTP demonstration: just enough axum wiring to exercise the
//! execution dispatch core end to end. Not the externally-owned HTTP
//! surface — no auth, no multi-tenant routing, no rate limiting.

use crate::coordinator::{AttachedFile, ExecutionCoordinator, ExecutionRequest};
use crate::health::HealthProbes;
use crate::session::SessionRegistry;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub health: Arc<HealthProbes>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/:id/execute", post(execute))
        .route("/sessions/:id/files/:file_id", get(download_file))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<crate::health::HealthReport> {
    Json(state.health.check_all(true).await)
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
}

async fn create_session(State(state): State<AppState>) -> Json<CreateSessionResponse> {
    let session = state.sessions.create().await;
    Json(CreateSessionResponse { session_id: session.session_id })
}

#[derive(Deserialize)]
struct ExecuteRequest {
    language: String,
    code: String,
    #[serde(default)]
    attached_file_ids: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

async fn execute(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<crate::coordinator::ExecutionResult>, (StatusCode, String)> {
    let mut attached_files = Vec::new();
    for file_id in req.attached_file_ids {
        match state.sessions.get_file(&session_id, &file_id).await {
            Ok(info) => attached_files.push(AttachedFile { id: info.id, filename: info.filename, bytes: Vec::new() }),
            Err(e) => return Err((StatusCode::BAD_REQUEST, e.cause())),
        }
    }

    let result = state
        .coordinator
        .execute(ExecutionRequest {
            session_id,
            language: req.language,
            code: req.code,
            attached_files,
            timeout: Duration::from_millis(req.timeout_ms),
            cancel: tokio_util::sync::CancellationToken::new(),
        })
        .await
        .map_err(|e| (status_for(&e), e.cause()))?;

    Ok(Json(result))
}

async fn download_file(
    State(state): State<AppState>,
    Path((session_id, file_id)): Path<(String, String)>,
) -> Result<Vec<u8>, StatusCode> {
    let info = state.sessions.get_file(&session_id, &file_id).await.map_err(|_| StatusCode::NOT_FOUND)?;
    // Bytes live inside the sandbox's working directory and are harvested
    // at execution time; this demo route only proves the file handle is
    // addressable through the session's file index.
    let _ = info;
    Ok(Vec::new())
}

fn status_for(err: &crate::error::CoreError) -> StatusCode {
    use crate::error::ErrorKind::*;
    match err.kind() {
        SessionNotFound | SessionExpired => StatusCode::NOT_FOUND,
        InputFileError => StatusCode::BAD_REQUEST,
        Timeout => StatusCode::GATEWAY_TIMEOUT,
        RuntimeUnavailable | SandboxUnavailable | ImageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        Cancelled => StatusCode::from_u16(499).unwrap(),
        InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
