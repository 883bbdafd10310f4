//! Admin API for worker management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is never exposed
//! alongside the generation endpoint. Every route requires
//! `Authorization: Bearer <admin key>`; with no key configured every request
//! is rejected.
//!
//! Endpoints:
//! - GET    /admin/workers               list workers (no secrets)
//! - POST   /admin/workers               add a worker from a refresh credential
//! - POST   /admin/workers/import        batch upsert keyed by account email
//! - GET    /admin/workers/{id}          one worker
//! - PUT    /admin/workers/{id}          partial update
//! - DELETE /admin/workers/{id}          remove
//! - POST   /admin/workers/{id}/enable   enable (lifts an error ban)
//! - POST   /admin/workers/{id}/disable  disable
//! - POST   /admin/workers/{id}/refresh  re-exchange the access credential
//! - POST   /admin/workers/{id}/refresh-credits  query the current credit balance
//! - GET    /admin/workers/{id}/health   health, error counter, ban countdown
//! - GET    /admin/pool                  pool summary
//! - GET    /admin/config                runtime tunables
//! - POST   /admin/config                update runtime tunables

use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::Secret;
use serde::Deserialize;
use tracing::{info, warn};

use worker_pool::{WorkerId, WorkerOptions, WorkerPool, WorkerSummary, WorkerUpdate};

use crate::error::ApiError;

type ApiResult = std::result::Result<Response, ApiError>;

/// Concurrency limits applied when an add or import omits them.
#[derive(Debug, Clone, Copy)]
pub struct WorkerDefaults {
    pub image_concurrency: i32,
    pub video_concurrency: i32,
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            image_concurrency: -1,
            video_concurrency: -1,
        }
    }
}

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<WorkerPool>,
    admin_key: Option<Arc<Secret<String>>>,
    defaults: WorkerDefaults,
}

impl AdminState {
    pub fn new(
        pool: Arc<WorkerPool>,
        admin_key: Option<Secret<String>>,
        defaults: WorkerDefaults,
    ) -> Self {
        Self {
            pool,
            admin_key: admin_key.map(Arc::new),
            defaults,
        }
    }
}

/// Build the admin router with all worker management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/workers", get(list_workers).post(add_worker))
        .route("/admin/workers/import", post(import_workers))
        .route(
            "/admin/workers/{id}",
            get(get_worker).put(update_worker).delete(remove_worker),
        )
        .route("/admin/workers/{id}/enable", post(enable_worker))
        .route("/admin/workers/{id}/disable", post(disable_worker))
        .route("/admin/workers/{id}/refresh", post(refresh_worker))
        .route("/admin/workers/{id}/refresh-credits", post(refresh_credits))
        .route("/admin/workers/{id}/health", get(worker_health))
        .route("/admin/pool", get(pool_summary))
        .route("/admin/config", get(get_config).post(set_config))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_key,
        ))
        .with_state(state)
}

async fn require_admin_key(State(state): State<AdminState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match (&state.admin_key, presented) {
        (Some(key), Some(presented)) if key.matches(presented) => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "admin request rejected");
            ApiError::unauthorized().into_response()
        }
    }
}

fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn summary_json(
    status: StatusCode,
    pool: &WorkerPool,
    record: &worker_pool::WorkerRecord,
) -> ApiResult {
    let summary = WorkerSummary::at(record, pool.store().now());
    let body = serde_json::to_value(&summary)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()))?;
    Ok(json(status, body))
}

fn body<T>(payload: std::result::Result<axum::Json<T>, JsonRejection>) -> std::result::Result<T, ApiError> {
    payload
        .map(|axum::Json(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

/// Worker fields accepted by add and import. Omitted concurrency limits fall
/// back to the configured defaults.
#[derive(Debug, Deserialize)]
struct WorkerRequest {
    refresh: String,
    project_id: Option<String>,
    project_name: Option<String>,
    remark: Option<String>,
    enabled: Option<bool>,
    image_enabled: Option<bool>,
    video_enabled: Option<bool>,
    image_concurrency: Option<i32>,
    video_concurrency: Option<i32>,
    credits: Option<i64>,
}

impl WorkerRequest {
    fn into_parts(self, defaults: WorkerDefaults) -> (String, WorkerOptions) {
        let options = WorkerOptions {
            project_id: self.project_id,
            project_name: self.project_name,
            remark: self.remark,
            enabled: self.enabled.unwrap_or(true),
            image_enabled: self.image_enabled.unwrap_or(true),
            video_enabled: self.video_enabled.unwrap_or(true),
            image_concurrency: self.image_concurrency.unwrap_or(defaults.image_concurrency),
            video_concurrency: self.video_concurrency.unwrap_or(defaults.video_concurrency),
            credits: self.credits,
        };
        (self.refresh.trim().to_string(), options)
    }
}

/// GET /admin/workers
async fn list_workers(State(state): State<AdminState>) -> ApiResult {
    let workers = state.pool.list_workers();
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "workers": workers }),
    ))
}

/// POST /admin/workers
async fn add_worker(
    State(state): State<AdminState>,
    payload: std::result::Result<axum::Json<WorkerRequest>, JsonRejection>,
) -> ApiResult {
    let (refresh, options) = body(payload)?.into_parts(state.defaults);
    if refresh.is_empty() {
        return Err(ApiError::bad_request("refresh credential is required"));
    }
    let record = state.pool.add_worker(refresh, options).await?;
    summary_json(StatusCode::CREATED, &state.pool, &record)
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    workers: Vec<WorkerRequest>,
}

/// POST /admin/workers/import
///
/// Each entry is added, or merged into the worker holding the same account.
/// A failing entry is reported and does not stop the batch.
async fn import_workers(
    State(state): State<AdminState>,
    payload: std::result::Result<axum::Json<ImportRequest>, JsonRejection>,
) -> ApiResult {
    let request = body(payload)?;
    let mut added = 0usize;
    let mut updated = 0usize;
    let mut errors = Vec::new();

    for (index, entry) in request.workers.into_iter().enumerate() {
        let (refresh, options) = entry.into_parts(state.defaults);
        if refresh.is_empty() {
            errors.push(serde_json::json!({ "index": index, "error": "refresh credential is required" }));
            continue;
        }
        match state.pool.import_worker(refresh, options).await {
            Ok((_, true)) => added += 1,
            Ok((_, false)) => updated += 1,
            Err(e) => {
                warn!(index, error = %e, "import entry failed");
                errors.push(serde_json::json!({ "index": index, "error": e.to_string() }));
            }
        }
    }

    info!(added, updated, failed = errors.len(), "worker import finished");
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "added": added, "updated": updated, "errors": errors }),
    ))
}

/// GET /admin/workers/{id}
async fn get_worker(State(state): State<AdminState>, Path(id): Path<WorkerId>) -> ApiResult {
    let view = state.pool.get_worker(id)?;
    let body = serde_json::to_value(&view)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()))?;
    Ok(json(StatusCode::OK, body))
}

/// PUT /admin/workers/{id}
async fn update_worker(
    State(state): State<AdminState>,
    Path(id): Path<WorkerId>,
    payload: std::result::Result<axum::Json<WorkerUpdate>, JsonRejection>,
) -> ApiResult {
    let update = body(payload)?;
    let record = state.pool.update_worker(id, update).await?;
    summary_json(StatusCode::OK, &state.pool, &record)
}

/// DELETE /admin/workers/{id}
async fn remove_worker(State(state): State<AdminState>, Path(id): Path<WorkerId>) -> ApiResult {
    state.pool.remove_worker(id).await?;
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "id": id, "status": "removed" }),
    ))
}

/// POST /admin/workers/{id}/enable
async fn enable_worker(State(state): State<AdminState>, Path(id): Path<WorkerId>) -> ApiResult {
    let record = state.pool.set_enabled(id, true).await?;
    summary_json(StatusCode::OK, &state.pool, &record)
}

/// POST /admin/workers/{id}/disable
async fn disable_worker(State(state): State<AdminState>, Path(id): Path<WorkerId>) -> ApiResult {
    let record = state.pool.set_enabled(id, false).await?;
    summary_json(StatusCode::OK, &state.pool, &record)
}

/// POST /admin/workers/{id}/refresh
async fn refresh_worker(State(state): State<AdminState>, Path(id): Path<WorkerId>) -> ApiResult {
    let record = state.pool.force_refresh(id).await?;
    summary_json(StatusCode::OK, &state.pool, &record)
}

/// POST /admin/workers/{id}/refresh-credits
async fn refresh_credits(State(state): State<AdminState>, Path(id): Path<WorkerId>) -> ApiResult {
    let record = state.pool.refresh_credits(id).await?;
    summary_json(StatusCode::OK, &state.pool, &record)
}

/// GET /admin/workers/{id}/health
async fn worker_health(State(state): State<AdminState>, Path(id): Path<WorkerId>) -> ApiResult {
    let health = state.pool.get_health(id)?;
    let body = serde_json::to_value(&health)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()))?;
    Ok(json(StatusCode::OK, body))
}

/// GET /admin/pool
async fn pool_summary(State(state): State<AdminState>) -> ApiResult {
    let body = serde_json::to_value(state.pool.summary())
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()))?;
    Ok(json(StatusCode::OK, body))
}

fn config_json(pool: &WorkerPool) -> serde_json::Value {
    serde_json::json!({ "error_ban_threshold": pool.error_threshold() })
}

/// GET /admin/config
async fn get_config(State(state): State<AdminState>) -> ApiResult {
    Ok(json(StatusCode::OK, config_json(&state.pool)))
}

#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    error_ban_threshold: Option<u32>,
}

/// POST /admin/config
async fn set_config(
    State(state): State<AdminState>,
    payload: std::result::Result<axum::Json<ConfigUpdate>, JsonRejection>,
) -> ApiResult {
    let update = body(payload)?;
    if let Some(threshold) = update.error_ban_threshold {
        state.pool.set_error_threshold(threshold)?;
        info!(error_ban_threshold = threshold, "error ban threshold updated");
    }
    Ok(json(StatusCode::OK, config_json(&state.pool)))
}
