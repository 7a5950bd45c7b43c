//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use tokio::sync::watch;

use crate::error::FarmError;
use crate::orchestrator::FarmControl;
use crate::scheduler::Thresholds;
use crate::task::{TaskId, TaskRecord};

#[derive(Clone)]
pub struct AppState {
    farm: Arc<dyn FarmControl>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(farm: Arc<dyn FarmControl>, shutdown: watch::Sender<bool>) -> Self {
        Self {
            farm,
            shutdown: Arc::new(shutdown),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TerminateRequest {
    #[serde(default = "default_terminate_reason")]
    pub reason: String,
}

fn default_terminate_reason() -> String {
    "terminated by operator".to_string()
}

#[derive(Debug, Deserialize)]
pub struct AcceptingRequest {
    pub accepting: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub addr: String,
}

fn error_response(err: FarmError) -> Response {
    let status = match &err {
        FarmError::UnknownTask(_) => StatusCode::NOT_FOUND,
        FarmError::DuplicateTask(_) => StatusCode::CONFLICT,
        FarmError::Terminating | FarmError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
        FarmError::MissingPassword | FarmError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FarmError::Listener(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn ok_json(value: serde_json::Value) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    match state.farm.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn enqueue_task(State(state): State<AppState>, Json(task): Json<TaskRecord>) -> Response {
    match state.farm.enqueue(task).await {
        Ok(id) => (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> Response {
    match state.farm.cancel(id).await {
        Ok(()) => ok_json(serde_json::json!({})),
        Err(e) => error_response(e),
    }
}

async fn stop_all(State(state): State<AppState>) -> Response {
    match state.farm.stop_all().await {
        Ok(signalled) => ok_json(serde_json::json!({ "signalled": signalled })),
        Err(e) => error_response(e),
    }
}

async fn continue_all(State(state): State<AppState>) -> Response {
    match state.farm.continue_all().await {
        Ok(signalled) => ok_json(serde_json::json!({ "signalled": signalled })),
        Err(e) => error_response(e),
    }
}

async fn terminate_all(
    State(state): State<AppState>,
    body: Option<Json<TerminateRequest>>,
) -> Response {
    let reason = body
        .map(|Json(r)| r.reason)
        .unwrap_or_else(default_terminate_reason);
    tracing::info!(%reason, "Terminate requested via HTTP");
    match state.farm.terminate_all(reason).await {
        Ok(killed) => ok_json(serde_json::json!({ "killed": killed })),
        Err(e) => error_response(e),
    }
}

async fn set_thresholds(
    State(state): State<AppState>,
    Json(thresholds): Json<Thresholds>,
) -> Response {
    match state.farm.set_thresholds(thresholds).await {
        Ok(()) => (StatusCode::OK, Json(thresholds)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn set_accepting(
    State(state): State<AppState>,
    Json(request): Json<AcceptingRequest>,
) -> Response {
    match state.farm.set_accepting(request.accepting).await {
        Ok(()) => ok_json(serde_json::json!({ "accepting": request.accepting })),
        Err(e) => error_response(e),
    }
}

async fn connect_client(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> Response {
    match state.farm.connect_client(request.addr).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({}))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    state.shutdown.send_replace(true);
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/tasks", post(enqueue_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/stop", post(stop_all))
        .route("/continue", post(continue_all))
        .route("/terminate", post(terminate_all))
        .route("/thresholds", put(set_thresholds))
        .route("/clients/accepting", put(set_accepting))
        .route("/clients/connect", post(connect_client))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}
