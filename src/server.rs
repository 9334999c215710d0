//! HTTP triggers for the sync pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `POST` | `/update-knowledge-base` | `x-cron-secret` | Start every due group, returns `{found, scheduled, failed}` |
//! | `POST` | `/update-group` | bearer | Body `{knowledgeGroupId}`; start a full sync |
//! | `POST` | `/update-item` | bearer | Body `{scrapeItemId}`; refresh one item |
//! | `POST` | `/stop-group` | bearer | Body `{knowledgeGroupId}`; stop the running sync |
//! | `GET`  | `/health` | none | Health check (returns version) |
//!
//! Authentication is skipped when the matching secret is not configured.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "not found: knowledge group 42" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `internal` (500).

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::error::SyncError;
use crate::pipeline::{CancelSummary, CronSummary, SyncPipeline};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pipeline: Arc<SyncPipeline>,
}

/// Build the trigger router.
pub fn router(config: Arc<Config>, pipeline: Arc<SyncPipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/update-knowledge-base", post(handle_update_knowledge_base))
        .route("/update-group", post(handle_update_group))
        .route("/update-item", post(handle_update_item))
        .route("/stop-group", post(handle_stop_group))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { config, pipeline })
}

/// Serve the triggers on `[server].bind` until `shutdown` fires.
pub async fn run_server(
    config: &Config,
    pipeline: Arc<SyncPipeline>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(Arc::new(config.clone()), pipeline);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "trigger server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized",
        message: message.into(),
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let (status, code) = match &err {
            SyncError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            SyncError::Config(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            _ => {
                error!(error = %err, "trigger failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ Auth ============

fn check_cron_secret(config: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = config.server.cron_secret.as_deref() else {
        return Ok(());
    };
    match headers.get("x-cron-secret").and_then(|v| v.to_str().ok()) {
        Some(given) if given == expected => Ok(()),
        _ => Err(unauthorized("missing or invalid x-cron-secret")),
    }
}

fn check_bearer(config: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = config.server.api_token.as_deref() else {
        return Ok(());
    };
    let given = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match given {
        Some(token) if token == expected => Ok(()),
        _ => Err(unauthorized("missing or invalid bearer token")),
    }
}

// ============ Handlers ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupRequest {
    knowledge_group_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemRequest {
    scrape_item_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartedResponse {
    message: &'static str,
    process_id: String,
}

#[derive(Serialize)]
struct StoppedResponse {
    message: &'static str,
    #[serde(flatten)]
    cancelled: CancelSummary,
}

async fn handle_update_knowledge_base(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CronSummary>, AppError> {
    check_cron_secret(&state.config, &headers)?;
    let summary = state.pipeline.schedule_due_groups(Utc::now()).await?;
    Ok(Json(summary))
}

async fn handle_update_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GroupRequest>,
) -> Result<Json<StartedResponse>, AppError> {
    check_bearer(&state.config, &headers)?;
    let process_id = state
        .pipeline
        .start_group_sync(&req.knowledge_group_id)
        .await?;
    Ok(Json(StartedResponse {
        message: "ok",
        process_id,
    }))
}

async fn handle_update_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ItemRequest>,
) -> Result<Json<StartedResponse>, AppError> {
    check_bearer(&state.config, &headers)?;
    let process_id = state.pipeline.start_item_sync(&req.scrape_item_id).await?;
    Ok(Json(StartedResponse {
        message: "ok",
        process_id,
    }))
}

async fn handle_stop_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GroupRequest>,
) -> Result<Json<StoppedResponse>, AppError> {
    check_bearer(&state.config, &headers)?;
    let cancelled = state.pipeline.stop_group(&req.knowledge_group_id).await?;
    Ok(Json(StoppedResponse {
        message: "ok",
        cancelled,
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
