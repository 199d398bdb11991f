//! Dashboard command - read-only monitoring page and JSON API
//!
//! Routes:
//! - `GET /` (HTML page polling the API below)
//! - `GET /health`
//! - `GET /api/stats`
//! - `GET /api/jobs?state=&limit=`
//! - `GET /api/dlq`
//! - `GET /api/workers`
//! - `GET /api/metrics`

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use queuectl_queue::{
    ExecutionStats, Job, JobFilter, JobState, JobStats, JobStore, MetricsReport, QueueError,
    RegistryRecord, WorkerRegistry,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::shutdown_signal;
use crate::print_success;
use crate::settings::Settings;

const DEFAULT_LIST_LIMIT: u32 = 100;

const INDEX_HTML: &str = include_str!("dashboard.html");

/// Arguments for the dashboard command
#[derive(Args)]
pub struct DashboardArgs {
    /// Port to listen on [default: dashboard_port setting]
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

pub async fn run(args: DashboardArgs, settings: &Settings) -> Result<()> {
    let store: Arc<dyn JobStore> = Arc::new(settings.open_store().await?);
    let state = DashboardState {
        store,
        registry: settings.registry(),
    };

    let port = args.port.unwrap_or(settings.dashboard_port);
    let addr: SocketAddr = format!("{}:{}", args.host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", args.host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    print_success(&format!(
        "Dashboard API listening on {}",
        format!("http://{}", addr).green()
    ));
    info!(%addr, "Dashboard started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Dashboard server failed")?;

    info!("Dashboard stopped");
    Ok(())
}

/// Handles shared by every route
#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<dyn JobStore>,
    pub registry: WorkerRegistry,
}

/// Build the read-only router
pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/jobs", get(jobs))
        .route("/api/dlq", get(dlq))
        .route("/api/workers", get(workers))
        .route("/api/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Maps store errors to HTTP statuses
pub struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::Validation(_) | QueueError::DuplicateId(_) => StatusCode::BAD_REQUEST,
            QueueError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Dashboard request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store: String,
    pub timestamp: DateTime<Utc>,
}

async fn health(State(state): State<DashboardState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: state.store.name().to_string(),
        timestamp: Utc::now(),
    })
}

async fn stats(State(state): State<DashboardState>) -> ApiResult<JobStats> {
    Ok(Json(state.store.get_stats().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub state: Option<JobState>,
    pub limit: Option<u32>,
}

async fn jobs(
    State(state): State<DashboardState>,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Vec<Job>> {
    let filter = JobFilter {
        state: query.state,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT)),
    };
    Ok(Json(state.store.list_jobs(&filter).await?))
}

async fn dlq(State(state): State<DashboardState>) -> ApiResult<Vec<Job>> {
    Ok(Json(state.store.get_dlq_jobs().await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkersResponse {
    pub running: bool,
    pub pool: Option<RegistryRecord>,
}

async fn workers(State(state): State<DashboardState>) -> ApiResult<WorkersResponse> {
    let pool = state.registry.read_running()?;
    Ok(Json(WorkersResponse {
        running: pool.is_some(),
        pool,
    }))
}

async fn metrics(State(state): State<DashboardState>) -> ApiResult<MetricsReport> {
    let execution = state
        .registry
        .read_running()?
        .map(|record| record.execution)
        .unwrap_or_else(ExecutionStats::default);
    Ok(Json(MetricsReport {
        jobs: state.store.get_stats().await?,
        execution,
        generated_at: Utc::now(),
    }))
}
