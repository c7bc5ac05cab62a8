use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Request, State, rejection::JsonRejection},
    http::StatusCode,
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;

use crate::errors::RunnerError;
use crate::runner::models::{RunSnapshot, ValidationRequest, now_rfc3339};
use crate::runner::orchestrator::Orchestrator;
use crate::runner::registry::{RunRecord, StreamItem, log_stream};

/// Longest a single log stream stays open.
const LOG_STREAM_CEILING: Duration = Duration::from_secs(300);
const RECENT_LOGS: usize = 50;
const RECENT_RUNS: usize = 50;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Expected `X-API-Key`. `None` leaves every route open.
    pub api_key: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Response payload types ────────────────────────────────────────────

#[derive(Serialize)]
pub struct StartedResponse {
    pub run_id: String,
    pub status: &'static str,
    pub branch: String,
    pub message: &'static str,
    pub status_url: String,
    pub logs_url: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(state: SharedState) -> Router<SharedState> {
    let protected = Router::new()
        .route("/validate", post(trigger_validation))
        .route("/validate/{run_id}", get(get_run))
        .route("/validate/{run_id}/details", get(get_run_details))
        .route("/validate/{run_id}/logs", get(stream_logs))
        .route("/status", get(runner_status))
        .route("/metrics", get(runner_metrics))
        .route_layer(middleware::from_fn_with_state(state, require_api_key));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
}

// ── Middleware ────────────────────────────────────────────────────────

async fn require_api_key(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = &state.api_key {
        let provided = req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        match provided {
            None => return Err(ApiError::Unauthorized("Missing X-API-Key header".into())),
            Some(key) if key != expected => {
                return Err(ApiError::Unauthorized("Invalid API key".into()));
            }
            Some(_) => {}
        }
    }
    Ok(next.run(req).await)
}

// ── Helpers ───────────────────────────────────────────────────────────

fn find_run(state: &SharedState, run_id: &str) -> Result<Arc<RunRecord>, ApiError> {
    state
        .orchestrator
        .store()
        .get(run_id)
        .ok_or_else(|| ApiError::NotFound(format!("Validation run {} not found", run_id)))
}

fn sse_events(
    record: Arc<RunRecord>,
    ceiling: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    log_stream(record, ceiling).map(|item| {
        let event = match item {
            StreamItem::Log(entry) => Event::default()
                .json_data(&entry)
                .unwrap_or_else(|_| Event::default().data(entry.message)),
            StreamItem::Finished(status) => Event::default()
                .event("end")
                .data(json!({"status": status}).to_string()),
        };
        Ok(event)
    })
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": now_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn trigger_validation(
    State(state): State<SharedState>,
    payload: Result<Json<ValidationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let branch = request.branch.clone();
    let record = state.orchestrator.start(request)?;
    let run_id = record.run_id();

    Ok(Json(StartedResponse {
        status_url: format!("/validate/{}", run_id),
        logs_url: format!("/validate/{}/logs", run_id),
        run_id,
        status: "started",
        branch,
        message: "Validation run started in background",
    }))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(find_run(&state, &run_id)?.snapshot()))
}

async fn get_run_details(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(find_run(&state, &run_id)?.details(RECENT_LOGS)))
}

async fn stream_logs(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = find_run(&state, &run_id)?;
    Ok(Sse::new(sse_events(record, LOG_STREAM_CEILING)).keep_alive(KeepAlive::default()))
}

async fn runner_status(State(state): State<SharedState>) -> impl IntoResponse {
    let store = state.orchestrator.store();
    let metrics = state.orchestrator.metrics().snapshot();
    let recent: Vec<RunSnapshot> = store.recent(RECENT_RUNS);
    Json(json!({
        "status": "operational",
        "active_validations": store.active_count(),
        "total_validations": metrics.validations_total,
        "success_rate": metrics.success_rate,
        "recent_runs": recent,
        "metrics": metrics,
    }))
}

async fn runner_metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.metrics().snapshot())
}
