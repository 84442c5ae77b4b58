use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::sse;
use crate::codegen::CodegenService;
use crate::codegen::models::{ManualSubmitRequest, TriggerRequest};
use crate::errors::CodegenError;
use crate::hub::Event;

/// Default and maximum page sizes for the event log.
const DEFAULT_LOG_LIMIT: u64 = 500;
const MAX_LOG_LIMIT: u64 = 1000;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: Arc<CodegenService>,
}

pub type SharedState = Arc<AppState>;

// ── Query types ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LogPage {
    pub events: Vec<Event>,
    pub total_events: u64,
    pub offset: u64,
    pub limit: u64,
    pub has_more: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<CodegenError> for ApiError {
    fn from(err: CodegenError) -> Self {
        match err {
            CodegenError::JobNotFound { .. } => ApiError::NotFound(err.to_string()),
            CodegenError::AlreadyFinished { .. } => ApiError::Conflict(err.to_string()),
            CodegenError::BadRequest(_) | CodegenError::Credentials(_) => {
                ApiError::BadRequest(err.to_string())
            }
            other => {
                error!(error = %other, "Request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<crate::errors::HubError> for ApiError {
    fn from(err: crate::errors::HubError) -> Self {
        CodegenError::from(err).into()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", post(trigger_job))
        .route("/api/jobs/manual", post(manual_submit))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/log", get(get_job_log))
        .route("/api/jobs/{id}/diff", get(get_job_diff))
        .route("/api/jobs/{id}/stream", get(sse::stream_job))
        .route("/api/requirements/{id}/jobs", get(list_requirement_jobs))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "live_jobs": state.service.registry().len(),
    }))
}

async fn trigger_job(
    State(state): State<SharedState>,
    Json(req): Json<TriggerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state.service.trigger(req).await?;
    Ok((StatusCode::ACCEPTED, Json(resp)))
}

async fn manual_submit(
    State(state): State<SharedState>,
    Json(req): Json<ManualSubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.manual_submit(req).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_job(id).await?))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.cancel(id).await?;
    Ok(Json(state.service.get_job(id).await?))
}

async fn get_job_log(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.get_job(id).await?;

    let offset = query.offset.unwrap_or(0);
    let limit = match query.limit {
        Some(0) | None => DEFAULT_LOG_LIMIT,
        Some(n) => n.min(MAX_LOG_LIMIT),
    };
    let hub = state.service.hub();
    let total_events = hub.total_events(id).await?;
    let events = hub.events_page(id, offset, limit).await?;
    Ok(Json(LogPage {
        events,
        total_events,
        offset,
        limit,
        has_more: offset + limit < total_events,
    }))
}

async fn get_job_diff(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.get_job(id).await?;
    Ok(Json(job.diff_stat))
}

async fn list_requirement_jobs(
    State(state): State<SharedState>,
    Path(requirement_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state
        .service
        .list_jobs(
            requirement_id,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(20),
        )
        .await?;
    Ok(Json(page))
}
