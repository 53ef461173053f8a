use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use clonesmith_common::{IntegrationConfig, ProtocolError, WorkerMessage};
use serde::Serialize;
use tracing::{debug, error};

use crate::errors::{IntegrationError, PipelineError, StoreError, WorkerError};
use crate::integrations::{IntegrationSpec, IntegrationStore, IntegrationUpdate};
use crate::pipeline::{PipelineRunner, TrainingRequest};
use crate::store::{ClonePatch, StoreHandle};
use crate::worker::WorkerManager;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: StoreHandle,
    pub integrations: IntegrationStore,
    pub pipeline: PipelineRunner,
    pub workers: WorkerManager,
}

pub type SharedState = Arc<AppState>;

#[derive(Serialize)]
struct WorkerEventAck {
    clone_id: String,
    status: clonesmith_common::WorkerStatus,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::Validation(_) => ApiError::BadRequest(err.to_string()),
            StoreError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            _ => internal(err),
        }
    }
}

impl From<IntegrationError> for ApiError {
    fn from(err: IntegrationError) -> Self {
        match err {
            IntegrationError::Validation(_) => ApiError::BadRequest(err.to_string()),
            _ => internal(err),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(_) => ApiError::BadRequest(err.to_string()),
            PipelineError::Store(store) => store.into(),
            _ => internal(err),
        }
    }
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::CloneNotFound(_) => ApiError::NotFound(err.to_string()),
            WorkerError::AlreadyRunning(_)
            | WorkerError::CloneNotTrained(_)
            | WorkerError::NotRegistered(_) => ApiError::Conflict(err.to_string()),
            WorkerError::Store(store) => store.into(),
            WorkerError::Integration(integration) => integration.into(),
            _ => internal(err),
        }
    }
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    error!(error = %err, "Request failed");
    ApiError::Internal(err.to_string())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/train", post(train))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/clones", get(list_clones))
        .route("/api/clones/{id}", get(get_clone))
        .route("/api/clones/{id}/start", post(start_clone))
        .route("/api/clones/{id}/stop", post(stop_clone))
        .route(
            "/api/clones/{id}/integrations",
            get(get_integrations).put(set_integrations),
        )
        .route(
            "/api/clones/{id}/integrations/{platform}",
            patch(upsert_integration),
        )
        .route("/api/worker/events", post(worker_event))
        .route("/api/workers", get(list_workers))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn train(
    State(state): State<SharedState>,
    Json(request): Json<TrainingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state.pipeline.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

async fn list_jobs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.store.list_jobs().await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.store.get_job(&id).await?;
    Ok(Json(job))
}

async fn list_clones(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let clones = state.store.list_clones().await?;
    Ok(Json(clones))
}

async fn get_clone(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let clone = state.store.get_clone(&id).await?;
    Ok(Json(clone))
}

async fn start_clone(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = state.workers.start(&id).await?;
    Ok(Json(worker))
}

async fn stop_clone(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_clone(&id).await?;
    let outcome = state.workers.stop(&id).await?;
    Ok(Json(outcome))
}

async fn get_integrations(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_clone(&id).await?;
    let list = state.integrations.get_integrations(&id).await?;
    Ok(Json(list))
}

async fn set_integrations(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(specs): Json<Vec<IntegrationSpec>>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_clone(&id).await?;
    let list = state.integrations.set_integrations(&id, specs).await?;
    sync_clone_integrations(&state, &id, &list).await?;
    Ok(Json(list))
}

async fn upsert_integration(
    State(state): State<SharedState>,
    Path((id, platform)): Path<(String, String)>,
    Json(update): Json<IntegrationUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_clone(&id).await?;
    let list = state
        .integrations
        .upsert_integration(&id, &platform, update)
        .await?;
    sync_clone_integrations(&state, &id, &list).await?;
    Ok(Json(list))
}

/// Keep the clone's integration id list in step with the integration store.
async fn sync_clone_integrations(
    state: &AppState,
    clone_id: &str,
    list: &[IntegrationConfig],
) -> Result<(), ApiError> {
    let ids = list
        .iter()
        .map(|c| IntegrationConfig::integration_id(clone_id, &c.platform))
        .collect();
    state
        .store
        .update_clone(
            clone_id,
            ClonePatch {
                integrations: Some(ids),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

async fn worker_event(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let message = WorkerMessage::parse(&body).map_err(|e| match &e {
        ProtocolError::Malformed(inner) if inner.is_data() => ApiError::Unprocessable(e.to_string()),
        _ => ApiError::BadRequest(e.to_string()),
    })?;
    debug!(clone_id = message.clone_id(), kind = message.kind(), "Worker event");

    state.store.get_clone(message.clone_id()).await?;
    let status = state.workers.handle_message(&message).await?;
    Ok(Json(WorkerEventAck {
        clone_id: message.clone_id().to_string(),
        status,
    }))
}

async fn list_workers(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.workers.snapshot().await)
}
