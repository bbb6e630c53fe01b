use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::db::{Doctype, JobStatus};
use crate::i18n::I18n;
use crate::pipeline::{CargoKey, StepName};

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} has used all {max_retries} retries")]
    RetryBudgetExhausted { job_id: String, max_retries: u32 },

    #[error("Step {step} is not a status flag for {doctype} documents")]
    UnknownStatusFlag { step: StepName, doctype: Doctype },

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Inference(#[from] InferenceError),

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("Unsupported media type: {mime}")]
    UnsupportedMediaType { mime: String },

    #[error("File too large: {size} bytes (max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Upload body exceeds the limit for a {max} byte document")]
    UploadTooLarge { max: u64 },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Job registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Job type already registered: {job_type}")]
    DuplicateJobType { job_type: String },

    #[error("Unknown job type: {job_type}")]
    UnknownJobType { job_type: String },

    #[error("Invalid input for {job_type}: {message}")]
    InvalidJobInput { job_type: String, message: String },

    #[error("Pipeline for {job_type} is invalid: {source}")]
    InvalidPipeline {
        job_type: String,
        #[source]
        source: PipelineError,
    },
}

/// Static pipeline definition errors, raised before any job runs
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PipelineError {
    #[error("step {step} (position {position}) requires `{key}`, which no earlier step produces")]
    UnsatisfiedRequirement {
        step: StepName,
        key: CargoKey,
        position: usize,
    },

    #[error("step {step} appears more than once")]
    DuplicateStep { step: StepName },

    #[error("pipeline for {doctype} has no steps")]
    Empty { doctype: Doctype },
}

/// Inference service client errors
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Connection failed to inference service at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Inference request failed (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response from inference service")]
    InvalidResponse {
        #[source]
        source: serde_json::Error,
    },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),
}

/// Object storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stored object not found: {path}")]
    Missing { path: String },

    #[error("Path escapes the storage root: {path}")]
    InvalidPath { path: String },
}

/// Errors returned by a single pipeline step
#[derive(Error, Debug)]
pub enum StepError {
    #[error("cargo key `{key}` has not been written")]
    MissingCargoKey { key: CargoKey },

    #[error("cargo key `{key}` holds an unexpected value")]
    InvalidCargoValue {
        key: CargoKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("detected language `{language}` is not supported")]
    UnsupportedLanguage { language: String },

    #[error("document contains no processable content")]
    EmptyContent,

    #[error("cancelled")]
    Cancelled,

    /// A shared batch request failed; every subject in the batch gets a copy
    #[error("batch failed: {message}")]
    BatchFailed { message: String, transient: bool },

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl StepError {
    /// Copy of a batch-level failure for one member of the batch
    pub fn batch_failed(error: &ServiceError) -> Self {
        StepError::BatchFailed {
            message: format_error_chain(error),
            transient: error.is_transient(),
        }
    }
}

/// Errors returned by job handlers. The runner decides retry-vs-fail from the variant.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("{message}")]
    Transient { message: String },

    #[error("{message}")]
    Permanent { message: String },

    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent {
            message: message.into(),
        }
    }

    /// Whether the retry policy applies to this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transient { .. } | JobError::Timeout { .. })
    }
}

impl ServiceError {
    /// Transient infrastructure failures are worth retrying; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Database(_) | ServiceError::Storage(StorageError::Io { .. }) => true,
            ServiceError::Inference(InferenceError::Connection { .. }) => true,
            ServiceError::Inference(InferenceError::Status { status, .. }) => {
                *status >= 500 || *status == 429
            }
            ServiceError::Internal { .. } => true,
            _ => false,
        }
    }
}

impl From<ServiceError> for JobError {
    fn from(error: ServiceError) -> Self {
        let message = format_error_chain(&error);
        match error {
            ServiceError::Registry(RegistryError::InvalidJobInput { .. }) => {
                JobError::InvalidInput { message }
            }
            ref e if e.is_transient() => JobError::Transient { message },
            _ => JobError::Permanent { message },
        }
    }
}

impl From<StepError> for JobError {
    fn from(error: StepError) -> Self {
        match error {
            StepError::Cancelled => JobError::Cancelled,
            StepError::Service(e) => e.into(),
            StepError::BatchFailed {
                message,
                transient: true,
            } => JobError::Transient { message },
            other => JobError::Permanent {
                message: format_error_chain(&other),
            },
        }
    }
}

/// Render an error and all of its sources as a single line
pub fn format_error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_message = cause.to_string();
        if !message.ends_with(&cause_message) {
            message.push_str(": ");
            message.push_str(&cause_message);
        }
        source = cause.source();
    }
    message
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::DocumentNotFound { .. }
            | ServiceError::JobNotFound { .. }
            | ServiceError::Registry(RegistryError::UnknownJobType { .. }) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::InvalidRequest { .. }
            | ServiceError::Registry(RegistryError::InvalidJobInput { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::InvalidTransition { .. }
            | ServiceError::RetryBudgetExhausted { .. }
            | ServiceError::Registry(RegistryError::DuplicateJobType { .. }) => {
                StatusCode::CONFLICT
            }
            ServiceError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ServiceError::FileTooLarge { .. } | ServiceError::UploadTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ServiceError::Inference(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::JobNotFound { .. } => "job_not_found",
            ServiceError::InvalidTransition { .. } => "invalid_transition",
            ServiceError::RetryBudgetExhausted { .. } => "retry_budget_exhausted",
            ServiceError::UnknownStatusFlag { .. } => "unknown_status_flag",
            ServiceError::Registry(RegistryError::DuplicateJobType { .. }) => {
                "duplicate_job_type"
            }
            ServiceError::Registry(RegistryError::UnknownJobType { .. }) => "unknown_job_type",
            ServiceError::Registry(RegistryError::InvalidJobInput { .. }) => "invalid_job_input",
            ServiceError::Registry(RegistryError::InvalidPipeline { .. }) => "invalid_pipeline",
            ServiceError::Inference(InferenceError::Connection { .. }) => "inference_connection",
            ServiceError::Inference(InferenceError::Status { .. }) => "inference_status",
            ServiceError::Inference(InferenceError::InvalidResponse { .. }) => {
                "inference_invalid_response"
            }
            ServiceError::Database(_) => "database_error",
            ServiceError::Storage(_) => "storage_error",
            ServiceError::UnsupportedMediaType { .. } => "unsupported_media_type",
            ServiceError::FileTooLarge { .. } | ServiceError::UploadTooLarge { .. } => {
                "file_too_large"
            }
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }

    /// Get a user-friendly translated message
    pub fn user_message(&self, i18n: &I18n, locale: &str) -> String {
        match self {
            ServiceError::DocumentNotFound { document_id } => {
                i18n.format(locale, "error-document-not-found", &[("id", document_id)])
            }
            ServiceError::JobNotFound { job_id } => {
                i18n.format(locale, "error-job-not-found", &[("id", job_id)])
            }
            ServiceError::Registry(RegistryError::UnknownJobType { job_type }) => {
                i18n.format(locale, "error-unknown-job-type", &[("job_type", job_type)])
            }
            ServiceError::InvalidTransition { from, to, .. } => i18n.format(
                locale,
                "error-invalid-transition",
                &[("from", from.as_ref()), ("to", to.as_ref())],
            ),
            ServiceError::Internal { .. } => i18n.get(locale, "error-internal", None),
            // For other errors, fall back to the technical message
            _ => format_error_chain(self),
        }
    }

    /// Convert to an error response with i18n support
    pub fn into_response_with_i18n(self, i18n: &I18n, locale: &str) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            message: self.user_message(i18n, locale),
            code: Some(self.error_code().to_string()),
        };

        (status, Json(response)).into_response()
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            message: format_error_chain(&self),
            code: Some(self.error_code().to_string()),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type alias for pipeline steps
pub type StepResult<T> = Result<T, StepError>;

/// Result type alias for job handlers
pub type JobResult<T> = Result<T, JobError>;

/// Error wrapper with i18n support for API responses
pub struct I18nError {
    pub error: ServiceError,
    pub i18n: std::sync::Arc<I18n>,
    pub locale: String,
}

impl I18nError {
    pub fn new(error: ServiceError, i18n: std::sync::Arc<I18n>, locale: impl Into<String>) -> Self {
        Self {
            error,
            i18n,
            locale: locale.into(),
        }
    }
}

impl IntoResponse for I18nError {
    fn into_response(self) -> Response {
        self.error.into_response_with_i18n(&self.i18n, &self.locale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let db_err: ServiceError =
            DatabaseError::Query(rusqlite::Error::QueryReturnedNoRows).into();
        assert!(JobError::from(db_err).is_retryable());

        let bad_gateway: ServiceError = InferenceError::Status {
            status: 503,
            message: "overloaded".to_string(),
        }
        .into();
        assert!(JobError::from(bad_gateway).is_retryable());

        let bad_request: ServiceError = InferenceError::Status {
            status: 422,
            message: "bad audio".to_string(),
        }
        .into();
        assert!(!JobError::from(bad_request).is_retryable());
    }

    #[test]
    fn test_step_errors_are_permanent_unless_infrastructure() {
        let missing = StepError::MissingCargoKey {
            key: CargoKey::Html,
        };
        assert!(matches!(
            JobError::from(missing),
            JobError::Permanent { .. }
        ));

        let unsupported = StepError::UnsupportedLanguage {
            language: "tlh".to_string(),
        };
        assert!(!JobError::from(unsupported).is_retryable());

        assert!(matches!(
            JobError::from(StepError::Cancelled),
            JobError::Cancelled
        ));

        let storage = StepError::Service(ServiceError::Storage(StorageError::Io {
            path: "files/ab".to_string(),
            source: std::io::Error::other("disk gone"),
        }));
        assert!(JobError::from(storage).is_retryable());

        let flush = StepError::batch_failed(&ServiceError::Inference(InferenceError::Status {
            status: 503,
            message: "overloaded".to_string(),
        }));
        assert!(JobError::from(flush).is_retryable());
    }

    #[test]
    fn test_format_error_chain_includes_sources() {
        let err = ServiceError::Storage(StorageError::Io {
            path: "files/ab".to_string(),
            source: std::io::Error::other("disk gone"),
        });
        assert_eq!(
            format_error_chain(&err),
            "Storage error: I/O error on files/ab: disk gone"
        );
    }
}
