//! HTTP API for the corpus service.
//!
//! This module provides the REST API endpoints for:
//! - Health and metrics monitoring
//! - Generic job operations for every registered job type
//! - Document upload, recompute and status
//! - Project health
//! - Settings and the live event stream

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{I18nError, ServiceError};
use crate::service::CorpusService;

pub mod documents;
pub mod events;
pub mod jobs;
pub mod settings;
use documents::{
    document_status_handler, project_health_handler, recompute_document_handler,
    upload_document_handler,
};
use events::events_handler;
use jobs::{
    abort_job_handler, get_job_handler, list_job_types_handler, list_jobs_handler,
    retry_job_handler, start_job_handler,
};
use settings::{get_settings_handler, update_settings_handler};

/// Application state
pub struct AppState {
    pub service: Arc<CorpusService>,
    pub start_time: Instant,
    pub metrics: PrometheusHandle,
}

impl AppState {
    /// Create an i18n-aware error from a service error
    pub fn i18n_error(&self, error: ServiceError) -> I18nError {
        I18nError::new(error, self.service.i18n.clone(), "en")
    }
}

/// Build the API router
pub fn router(service: Arc<CorpusService>, metrics: PrometheusHandle) -> Router {
    // Leave room for multipart framing so oversized files reach the size
    // check and get a proper error instead of a truncated body
    let max_body_size =
        service.runtime_config.dynamic().limits.max_document_size_bytes as usize + 1024 * 1024;

    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
        metrics,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Job endpoints, generic over the registry
        .route("/jobs", get(list_job_types_handler))
        .route("/job/{job_type}", post(start_job_handler))
        .route("/job/{job_type}/{id}", get(get_job_handler))
        .route("/job/{job_type}/{id}/abort", post(abort_job_handler))
        .route("/job/{job_type}/{id}/retry", post(retry_job_handler))
        .route("/job/{job_type}/project/{project_id}", get(list_jobs_handler))
        // Document endpoints - with larger body limit for file uploads
        .route(
            "/documents",
            post(upload_document_handler).layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/documents/{id}/recompute", post(recompute_document_handler))
        .route("/documents/{id}/status", get(document_status_handler))
        .route("/projects/{project_id}/health", get(project_health_handler))
        // Live progress
        .route("/events", get(events_handler))
        // Settings endpoints
        .route("/settings", get(get_settings_handler).put(update_settings_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health & Metrics ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let inference_healthy = state.service.inference.health_check().await;

    let queued_jobs = match state.service.db.queued_job_counts() {
        Ok(counts) => counts
            .into_iter()
            .map(|(class, count)| (class.to_string(), count))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to count queued jobs");
            BTreeMap::new()
        }
    };

    let status = if inference_healthy {
        state.service.i18n.get("en", "health-status-healthy", None)
    } else {
        state.service.i18n.format(
            "en",
            "health-status-degraded",
            &[("reason", "inference service unavailable")],
        )
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        inference_available: inference_healthy,
        queued_jobs,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    inference_available: bool,
    /// Queued jobs per concurrency class
    queued_jobs: BTreeMap<String, u64>,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
