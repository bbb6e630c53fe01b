//! Generic job endpoints. Every registered job type is reachable through
//! the same routes; the registry decides what the payload means.

use axum::{
    Json,
    extract::{Path, State},
};
use std::sync::Arc;

use crate::api::AppState;
use crate::db::JobRecord;
use crate::error::I18nError;
use crate::jobs::JobTypeInfo;

/// GET /api/jobs - registered job types with their input schemas
pub async fn list_job_types_handler(State(state): State<Arc<AppState>>) -> Json<Vec<JobTypeInfo>> {
    Json(state.service.job_types())
}

/// POST /api/job/{job_type} - validate the payload and enqueue a job
pub async fn start_job_handler(
    State(state): State<Arc<AppState>>,
    Path(job_type): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<JobRecord>, I18nError> {
    let job = state
        .service
        .start_job(&job_type, payload)
        .map_err(|e| state.i18n_error(e))?;

    Ok(Json(job))
}

/// GET /api/job/{job_type}/{id}
pub async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Path((job_type, id)): Path<(String, String)>,
) -> Result<Json<JobRecord>, I18nError> {
    let job = state
        .service
        .get_job(&job_type, &id)
        .map_err(|e| state.i18n_error(e))?;

    Ok(Json(job))
}

/// POST /api/job/{job_type}/{id}/abort
pub async fn abort_job_handler(
    State(state): State<Arc<AppState>>,
    Path((job_type, id)): Path<(String, String)>,
) -> Result<Json<JobRecord>, I18nError> {
    let job = state
        .service
        .abort_job(&job_type, &id)
        .map_err(|e| state.i18n_error(e))?;

    Ok(Json(job))
}

/// POST /api/job/{job_type}/{id}/retry - requeue an errored job
pub async fn retry_job_handler(
    State(state): State<Arc<AppState>>,
    Path((job_type, id)): Path<(String, String)>,
) -> Result<Json<JobRecord>, I18nError> {
    let job = state
        .service
        .retry_job(&job_type, &id)
        .map_err(|e| state.i18n_error(e))?;

    Ok(Json(job))
}

/// GET /api/job/{job_type}/project/{project_id}
pub async fn list_jobs_handler(
    State(state): State<Arc<AppState>>,
    Path((job_type, project_id)): Path<(String, String)>,
) -> Result<Json<Vec<JobRecord>>, I18nError> {
    let jobs = state
        .service
        .list_jobs(&job_type, &project_id)
        .map_err(|e| state.i18n_error(e))?;

    Ok(Json(jobs))
}
