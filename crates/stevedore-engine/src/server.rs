// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API server.
//!
//! Routing and JSON are the only concerns of this module; all semantics
//! live in [`crate::control`] and the store. Request authentication is an
//! external collaborator: the fronting gateway authenticates the caller
//! and injects the owner id as the `X-Stevedore-User` header, which the
//! [`Caller`] extractor validates. The webhook trigger route is
//! deliberately unauthenticated: the token itself is the capability.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use stevedore_core::{CreateJob, StoreError, jobs, runs};

use crate::control::{self, ControlError};
use crate::runner::ContainerRuntime;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database pool.
    pub pool: PgPool,
    /// Container runtime, used by control commands.
    pub runtime: Arc<dyn ContainerRuntime>,
}

/// The authenticated caller, extracted from the `X-Stevedore-User`
/// header injected by the external authentication layer.
pub struct Caller(pub Uuid);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-stevedore-user")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .map(Caller)
            .ok_or(ApiError::Unauthorized)
    }
}

/// API error responses with stable error codes.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or malformed caller identity.
    Unauthorized,
    /// Unknown or unowned resource; uniform to avoid leaking existence.
    NotFound,
    /// Request validation failed.
    Validation(&'static str),
    /// Precondition on the current state failed.
    Conflict(String),
    /// Anything else; details are logged, not leaked.
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Missing or invalid caller identity".to_string(),
            ),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                "not_found",
                "Resource not found".to_string(),
            ),
            ApiError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg.to_string())
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal error".to_string(),
            ),
        };

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::Duplicate(what) => {
                ApiError::Conflict(format!("A {what} with this value already exists"))
            }
            StoreError::Database(e) => {
                error!(error = %e, "Database error");
                ApiError::Internal
            }
            // StoreError is non-exhaustive upstream.
            _ => ApiError::Internal,
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::NotFound => ApiError::NotFound,
            ControlError::InvalidState(msg) => ApiError::Conflict(msg.to_string()),
            ControlError::Store(e) => e.into(),
            ControlError::Runtime(e) => {
                error!(error = %e, "Runtime error in control command");
                ApiError::Internal
            }
        }
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/{job_id}", get(get_job).delete(delete_job))
        .route("/jobs/{job_id}/run", post(trigger_run))
        .route("/jobs/{job_id}/webhook", post(generate_webhook))
        .route("/jobs/{job_id}/runs", get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/pause", post(pause_run))
        .route("/runs/{run_id}/resume", post(resume_run))
        .route("/runs/{run_id}/kill", post(kill_run))
        .route("/runs/{run_id}/logs", get(run_logs))
        .route("/webhooks/{token}/trigger", post(webhook_trigger));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn health(State(state): State<AppState>) -> Response {
    match stevedore_core::db::health_check(&state.pool).await {
        Ok(()) => Json(json!({ "status": "ok", "service": "stevedore" })).into_response(),
        Err(e) => {
            error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "service": "stevedore" })),
            )
                .into_response()
        }
    }
}

async fn create_job(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Json(req): Json<CreateJob>,
) -> Result<Response, ApiError> {
    if req.name.is_empty() || req.image.is_empty() {
        return Err(ApiError::Validation("Name and image are required"));
    }
    if let Some(ref schedule) = req.schedule {
        if crate::scheduler::parse_schedule(schedule).is_err() {
            return Err(ApiError::Validation("Invalid cron expression"));
        }
    }

    let job = jobs::create(&state.pool, owner_id, req).await?;
    Ok((StatusCode::CREATED, Json(job)).into_response())
}

async fn list_jobs(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
) -> Result<Response, ApiError> {
    let jobs = jobs::list(&state.pool, owner_id).await?;
    Ok(Json(jobs).into_response())
}

async fn get_job(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = jobs::get(&state.pool, owner_id, job_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(job).into_response())
}

async fn delete_job(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    if !jobs::delete(&state.pool, owner_id, job_id).await? {
        return Err(ApiError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn trigger_run(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let run = control::trigger(&state.pool, owner_id, job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)).into_response())
}

async fn generate_webhook(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let token = control::regenerate_webhook_token(&state.pool, owner_id, job_id).await?;
    Ok(Json(json!({
        "webhook_token": token,
        "trigger_url": format!("/api/v1/webhooks/{token}/trigger"),
    }))
    .into_response())
}

async fn webhook_trigger(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let run = control::webhook_trigger(&state.pool, &token).await?;
    Ok((StatusCode::ACCEPTED, Json(run)).into_response())
}

async fn list_runs(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let runs = runs::list_for_job(&state.pool, owner_id, job_id, 50).await?;
    Ok(Json(runs).into_response())
}

async fn get_run(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let run = runs::get(&state.pool, owner_id, run_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(run).into_response())
}

async fn pause_run(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    control::pause(&state.pool, &state.runtime, owner_id, run_id).await?;
    Ok(Json(json!({
        "status": "paused",
        "message": "Container paused. Use resume to continue or kill to terminate.",
    }))
    .into_response())
}

async fn resume_run(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    control::resume(&state.pool, &state.runtime, owner_id, run_id).await?;
    Ok(Json(json!({
        "status": "running",
        "message": "Container resumed from paused state.",
    }))
    .into_response())
}

async fn kill_run(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    control::kill(&state.pool, &state.runtime, owner_id, run_id).await?;
    Ok(Json(json!({
        "status": "cancelled",
        "message": "Job killed.",
    }))
    .into_response())
}

async fn run_logs(
    State(state): State<AppState>,
    Caller(owner_id): Caller,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let logs = control::logs(&state.pool, &state.runtime, owner_id, run_id).await?;
    Ok(Json(json!({ "logs": logs })).into_response())
}
