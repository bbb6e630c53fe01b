//! Document pipelines as job types.
//!
//! A pipeline job carries everything the first step needs for each document,
//! so it can run without reading the documents table. Recompute requests send
//! only document ids and [`PipelineEnricher`] fills in the rest.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::catalog::pipeline_job_type;
use super::definition::PipelineDefinition;
use super::executor::execute;
use super::{Cargo, CargoKey, PIPELINE_INPUT_KEYS, StepName};
use crate::db::{ConcurrencyClass, Database, Doctype};
use crate::error::{
    JobError, JobResult, RegistryError, ServiceError, ServiceResult, StepResult, format_error_chain,
};
use crate::jobs::{Enricher, JobContext, JobDescriptor, JobHandler, JobInput, JobRegistry};

/// A document as the pipeline sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DocumentRef {
    pub id: String,
    pub doctype: Doctype,
    /// Object store path of the uploaded file
    pub file_path: String,
    pub filename: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineInput {
    pub project_id: String,
    pub documents: Vec<DocumentRef>,
}

impl JobInput for PipelineInput {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    fn validate(&self) -> Result<(), String> {
        if self.documents.is_empty() {
            return Err("at least one document is required".to_string());
        }
        let doctype = self.documents[0].doctype;
        if self.documents.iter().any(|d| d.doctype != doctype) {
            return Err("all documents of a pipeline job must share a doctype".to_string());
        }
        Ok(())
    }
}

/// Identifying fields only. A full [`PipelineInput`] is also a valid reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReference {
    pub project_id: String,
    pub documents: Vec<DocumentKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentKey {
    pub id: String,
}

impl PipelineReference {
    pub fn new(project_id: impl Into<String>, document_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            project_id: project_id.into(),
            documents: document_ids.into_iter().map(|id| DocumentKey { id }).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CompletedDocument {
    pub document_id: String,
    /// Resolved language code, for doctypes that detect one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FailedDocument {
    pub document_id: String,
    pub step: StepName,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineOutput {
    pub completed: Vec<CompletedDocument>,
    pub failed: Vec<FailedDocument>,
}

/// Runs one pipeline definition over the documents of a job
pub struct PipelineJob {
    definition: Arc<PipelineDefinition>,
}

impl PipelineJob {
    pub fn new(definition: PipelineDefinition) -> Self {
        Self {
            definition: Arc::new(definition),
        }
    }
}

fn seed_cargo(project_id: &str, document: &DocumentRef) -> StepResult<Cargo> {
    Cargo::new(&document.id, project_id, document.doctype)
        .with(CargoKey::Path, &document.file_path)?
        .with(CargoKey::Filename, &document.filename)?
        .with(CargoKey::MimeType, &document.mime_type)
}

impl JobHandler for PipelineJob {
    type Input = PipelineInput;
    type Output = PipelineOutput;

    fn handle(&self, ctx: JobContext, input: PipelineInput) -> BoxFuture<'static, JobResult<PipelineOutput>> {
        let definition = self.definition.clone();
        async move {
            if let Some(document) = input
                .documents
                .iter()
                .find(|d| d.doctype != definition.doctype())
            {
                return Err(JobError::permanent(format!(
                    "document {} is {}, not {}",
                    document.id,
                    document.doctype,
                    definition.doctype()
                )));
            }

            let cargos = input
                .documents
                .iter()
                .map(|document| seed_cargo(&input.project_id, document))
                .collect::<StepResult<Vec<_>>>()?;

            let step_ctx = ctx.step_context();
            let mut report = execute(&definition, &step_ctx, cargos).await?;

            if report.all_failed() {
                // Surface the first failure so the retry policy sees its class
                let first = report.failed.swap_remove(0);
                return Err(first.error.into());
            }

            let completed = report
                .succeeded
                .iter()
                .map(|cargo| {
                    Ok(CompletedDocument {
                        document_id: cargo.subject_id.clone(),
                        language: cargo.get_opt(CargoKey::Language)?,
                    })
                })
                .collect::<StepResult<Vec<_>>>()?;
            let failed = report
                .failed
                .into_iter()
                .map(|failure| FailedDocument {
                    document_id: failure.subject_id,
                    step: failure.step,
                    error: format_error_chain(&failure.error),
                })
                .collect::<Vec<_>>();

            info!(
                job_id = %ctx.job_id,
                completed = completed.len(),
                failed = failed.len(),
                "Pipeline run complete"
            );
            Ok(PipelineOutput { completed, failed })
        }
        .boxed()
    }
}

/// Rebuilds a [`PipelineInput`] from document ids
pub struct PipelineEnricher;

impl Enricher for PipelineEnricher {
    type Reference = PipelineReference;
    type Input = PipelineInput;

    fn enrich(&self, db: &Database, reference: PipelineReference) -> ServiceResult<PipelineInput> {
        let documents = reference
            .documents
            .into_iter()
            .map(|key| {
                let document = db
                    .get_document(&key.id)?
                    .ok_or_else(|| ServiceError::DocumentNotFound {
                        document_id: key.id.clone(),
                    })?;
                if document.project_id != reference.project_id {
                    return Err(ServiceError::InvalidRequest {
                        message: format!(
                            "document {} belongs to project {}",
                            document.id, document.project_id
                        ),
                    });
                }
                Ok(DocumentRef {
                    id: document.id,
                    doctype: document.doctype,
                    file_path: document.file_path,
                    filename: document.filename,
                    mime_type: document.mime_type,
                })
            })
            .collect::<ServiceResult<Vec<_>>>()?;

        Ok(PipelineInput {
            project_id: reference.project_id,
            documents,
        })
    }
}

impl JobRegistry {
    /// Register `definition` under its doctype's job type after checking it
    /// statically. An invalid definition is never registered.
    pub fn register_pipeline(&self, definition: PipelineDefinition) -> Result<(), RegistryError> {
        let job_type = pipeline_job_type(definition.doctype());
        definition
            .validate(PIPELINE_INPUT_KEYS)
            .map_err(|source| RegistryError::InvalidPipeline {
                job_type: job_type.clone(),
                source,
            })?;

        let steps = definition.step_names();
        self.register(
            JobDescriptor::new(job_type, PipelineJob::new(definition))
                .enricher(PipelineEnricher)
                .concurrency_class(ConcurrencyClass::Gpu)
                .steps(steps),
        )
    }
}
