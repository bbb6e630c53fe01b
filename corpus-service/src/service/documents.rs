//! Document triggers: upload and recompute, plus status reads.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::db::{Doctype, Document, JobRecord};
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::catalog::pipeline_job_type;
use crate::pipeline::job::{DocumentRef, PipelineInput, PipelineReference};
use crate::service::CorpusService;
use crate::status::{ProjectHealth, StatusRecord};

/// An uploaded file awaiting registration
pub struct Upload {
    pub project_id: String,
    pub filename: String,
    pub title: Option<String>,
    /// Content type sent by the client, if any
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl CorpusService {
    /// Store an upload, register the document and its status record, and
    /// enqueue the doctype's pipeline
    pub async fn upload_document(&self, upload: Upload) -> ServiceResult<(Document, JobRecord)> {
        let max = self.runtime_config.dynamic().limits.max_document_size_bytes;
        let size = upload.bytes.len() as u64;
        if size > max {
            return Err(ServiceError::FileTooLarge { size, max });
        }
        if upload.project_id.trim().is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "project_id is required".to_string(),
            });
        }

        let mime = upload
            .content_type
            .as_deref()
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
            .filter(|m| *m != mime::APPLICATION_OCTET_STREAM)
            .unwrap_or_else(|| Doctype::guess_mime(&upload.filename));
        let doctype = Doctype::from_mime(&mime).ok_or_else(|| ServiceError::UnsupportedMediaType {
            mime: mime.to_string(),
        })?;

        let job_type = pipeline_job_type(doctype);
        let descriptor = self.registry.resolve(&job_type)?;

        let extension = std::path::Path::new(&upload.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_else(|| "bin".to_string());
        let stored = self.storage.store(&upload.bytes, &extension).await?;

        let now = Utc::now();
        let document = Document {
            id: Uuid::new_v4().to_string(),
            project_id: upload.project_id,
            doctype,
            title: upload.title.unwrap_or_else(|| upload.filename.clone()),
            filename: upload.filename,
            file_path: stored.path,
            content_hash: stored.content_hash,
            mime_type: mime.essence_str().to_string(),
            language: None,
            text: None,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_document(&document, descriptor.step_names())?;
        info!(doc_id = %document.id, doctype = %doctype, size, "Document registered");

        let input = PipelineInput {
            project_id: document.project_id.clone(),
            documents: vec![DocumentRef {
                id: document.id.clone(),
                doctype,
                file_path: document.file_path.clone(),
                filename: document.filename.clone(),
                mime_type: document.mime_type.clone(),
            }],
        };
        let payload = serde_json::to_value(&input).map_err(|e| ServiceError::Internal {
            message: format!("Failed to serialize pipeline input: {e}"),
        })?;
        let job = self.start_job(&job_type, payload)?;

        Ok((document, job))
    }

    /// Re-run a document's pipeline from persisted state
    pub fn recompute_document(&self, document_id: &str) -> ServiceResult<JobRecord> {
        let document = self
            .db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })?;

        let reference = PipelineReference::new(document.project_id, [document.id]);
        let reference = serde_json::to_value(reference).map_err(|e| ServiceError::Internal {
            message: format!("Failed to serialize reference: {e}"),
        })?;
        self.start_job_from_reference(&pipeline_job_type(document.doctype), &reference)
    }

    pub fn document_status(&self, document_id: &str) -> ServiceResult<StatusRecord> {
        self.db
            .get_status_record(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })
    }

    pub fn project_health(&self, project_id: &str) -> ServiceResult<ProjectHealth> {
        self.db.project_health(project_id)
    }
}
