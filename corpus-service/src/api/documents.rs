//! Document API endpoints.
//!
//! Upload starts the doctype's pipeline; recompute reruns it; status and
//! project health read the per-step flags.

use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::StatusCode,
};
use serde::Serialize;
use std::sync::Arc;

use crate::db::{Document, JobRecord};
use crate::error::{I18nError, ServiceError};
use crate::service::Upload;
use crate::status::{ProjectHealth, StatusRecord};

use super::AppState;

/// Response for a successful upload
#[derive(Serialize)]
pub struct UploadResponse {
    pub document: Document,
    pub job: JobRecord,
}

/// POST /api/documents - multipart upload with `project_id`, `file` and an
/// optional `title`
pub async fn upload_document_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, I18nError> {
    let invalid = |message: String| state.i18n_error(ServiceError::InvalidRequest { message });

    let mut file: Option<(Vec<u8>, String, Option<String>)> = None;
    let mut project_id: Option<String> = None;
    let mut title: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(&state, e))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("document").to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(|e| multipart_error(&state, e))?;
                file = Some((data.to_vec(), filename, content_type));
            }
            "project_id" => {
                project_id = Some(field.text().await.map_err(|e| multipart_error(&state, e))?);
            }
            "title" => {
                let text = field.text().await.map_err(|e| multipart_error(&state, e))?;
                if !text.trim().is_empty() {
                    title = Some(text);
                }
            }
            _ => {}
        }
    }

    let (bytes, filename, content_type) =
        file.ok_or_else(|| invalid("No file provided".to_string()))?;
    let project_id = project_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| invalid("No project_id provided".to_string()))?;

    let (document, job) = state
        .service
        .upload_document(Upload {
            project_id,
            filename,
            title,
            content_type,
            bytes,
        })
        .await
        .map_err(|e| state.i18n_error(e))?;

    Ok(Json(UploadResponse { document, job }))
}

/// A body cut off by the size limit is reported as too large rather than as
/// a malformed form
fn multipart_error(state: &AppState, error: MultipartError) -> I18nError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        let max = state.service.runtime_config.dynamic().limits.max_document_size_bytes;
        return state.i18n_error(ServiceError::UploadTooLarge { max });
    }

    state.i18n_error(ServiceError::InvalidRequest {
        message: error.body_text(),
    })
}

/// POST /api/documents/{id}/recompute - rerun the document's pipeline
pub async fn recompute_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, I18nError> {
    let job = state
        .service
        .recompute_document(&id)
        .map_err(|e| state.i18n_error(e))?;

    Ok(Json(job))
}

/// GET /api/documents/{id}/status
pub async fn document_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatusRecord>, I18nError> {
    let status = state
        .service
        .document_status(&id)
        .map_err(|e| state.i18n_error(e))?;

    Ok(Json(status))
}

/// GET /api/projects/{project_id}/health
pub async fn project_health_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectHealth>, I18nError> {
    let health = state
        .service
        .project_health(&project_id)
        .map_err(|e| state.i18n_error(e))?;

    Ok(Json(health))
}
