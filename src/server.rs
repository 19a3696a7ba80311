//! HTTP triggers and read endpoints.
//!
//! | Method | Path | |
//! |--------|------|-|
//! | `POST` | `/scans` | create a scan and kick its first batch |
//! | `GET` | `/scans` | recent scans |
//! | `GET` | `/scans/{id}` | scan progress |
//! | `POST` | `/scans/{id}/cancel` | cancel, `409` once terminal |
//! | `GET` | `/scans/{id}/cells` | cell results |
//! | `GET` | `/scans/{id}/metrics` | aggregates, failure reasons, alerts |
//! | `POST` | `/batch` | process `{scanId, startIndex, size}` |
//! | `POST` | `/resume` | one resume cycle |
//! | `GET` | `/metrics/daily` | daily rollups, `?days=N` |
//! | `GET` | `/health` | liveness |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::batch::BatchOutcome;
use crate::error::ScanError;
use crate::metrics::{self, DailyReport, ScanReport};
use crate::models::{CellResult, NewScan, Scan};
use crate::orchestrator::{CreatedScan, ResumeOutcome};
use crate::scraping_context::ScrapingContext;

type AppState = Arc<ScrapingContext>;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;
const DEFAULT_DAILY_WINDOW: u32 = 7;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/scans", post(handle_create_scan).get(handle_list_scans))
        .route("/scans/{id}", get(handle_get_scan))
        .route("/scans/{id}/cancel", post(handle_cancel_scan))
        .route("/scans/{id}/cells", get(handle_scan_cells))
        .route("/scans/{id}/metrics", get(handle_scan_metrics))
        .route("/batch", post(handle_batch))
        .route("/resume", post(handle_resume))
        .route("/metrics/daily", get(handle_daily_metrics))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Serves until the context's shutdown token fires.
pub async fn run_server(state: AppState, listener: TcpListener) -> anyhow::Result<()> {
    info!("Listening on http://{}", listener.local_addr()?);
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
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
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<ScanError> for AppError {
    fn from(err: ScanError) -> Self {
        let (status, code) = match &err {
            ScanError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ScanError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            ScanError::InvalidParams(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ScanError::Store(e) => {
                error!("Store failure: {:#}", e);
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        ScanError::Store(err).into()
    }
}

fn parse_scan_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("malformed scan id: {}", raw)))
}

// ============ Scans ============

async fn handle_create_scan(
    State(state): State<AppState>,
    Json(params): Json<NewScan>,
) -> Result<(StatusCode, Json<CreatedScan>), AppError> {
    let scan = state.orchestrator.start_scan(&params).await?;
    Ok((StatusCode::CREATED, Json(CreatedScan::from(&scan))))
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn handle_list_scans(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Scan>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.store.list_scans(limit).await?))
}

async fn handle_get_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Scan>, AppError> {
    let id = parse_scan_id(&id)?;
    Ok(Json(state.orchestrator.get_scan(id).await?))
}

async fn handle_cancel_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Scan>, AppError> {
    let id = parse_scan_id(&id)?;
    Ok(Json(state.orchestrator.cancel(id).await?))
}

async fn handle_scan_cells(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CellResult>>, AppError> {
    let id = parse_scan_id(&id)?;
    state.orchestrator.get_scan(id).await?;
    Ok(Json(state.store.list_cells(id).await?))
}

async fn handle_scan_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ScanReport>, AppError> {
    let id = parse_scan_id(&id)?;
    state.orchestrator.get_scan(id).await?;
    let report = metrics::scan_report(state.events.as_ref(), id, &state.health).await?;
    Ok(Json(report))
}

// ============ Triggers ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    scan_id: String,
    #[serde(default)]
    start_index: i64,
    size: Option<i64>,
}

async fn handle_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchOutcome>, AppError> {
    let scan_id = parse_scan_id(&request.scan_id)?;
    if request.start_index < 0 {
        return Err(bad_request("startIndex must not be negative"));
    }
    let size = match request.size {
        Some(size) if size <= 0 => return Err(bad_request("size must be positive")),
        Some(size) => size as u64,
        None => state.orchestrator.config().batch_size,
    };
    let outcome = state
        .orchestrator
        .batch()
        .process_batch(scan_id, request.start_index as u64, size)
        .await?;
    Ok(Json(outcome))
}

async fn handle_resume(State(state): State<AppState>) -> Result<Json<ResumeOutcome>, AppError> {
    Ok(Json(state.orchestrator.resume_once().await?))
}

// ============ Metrics ============

#[derive(Deserialize)]
struct DailyQuery {
    days: Option<u32>,
}

async fn handle_daily_metrics(
    State(state): State<AppState>,
    Query(query): Query<DailyQuery>,
) -> Result<Json<DailyReport>, AppError> {
    let days = query.days.unwrap_or(DEFAULT_DAILY_WINDOW);
    let report = metrics::daily_report(state.events.as_ref(), days, &state.health).await?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
