//! Shared services handed to job handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{DynamicConfig, RuntimeConfig};
use crate::db::{Database, JobRecord};
use crate::events::EventBus;
use crate::i18n::I18n;
use crate::inference::Inference;
use crate::pipeline::StepContext;
use crate::storage::FileStore;

/// Process-wide services, built once at startup
#[derive(Clone)]
pub struct JobResources {
    pub db: Arc<Database>,
    pub storage: Arc<FileStore>,
    pub inference: Arc<dyn Inference>,
    pub config: Arc<RuntimeConfig>,
    pub events: EventBus,
    pub i18n: Arc<I18n>,
}

/// Everything one job run may use
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_type: String,
    pub project_id: String,
    /// Zero on the first attempt
    pub retry_count: u32,
    pub db: Arc<Database>,
    pub storage: Arc<FileStore>,
    pub inference: Arc<dyn Inference>,
    /// Settings as they were when the job started
    pub config: Arc<DynamicConfig>,
    pub events: EventBus,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job: &JobRecord, resources: &JobResources, cancel: CancellationToken) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            project_id: job.project_id.clone(),
            retry_count: job.retry_count,
            db: resources.db.clone(),
            storage: resources.storage.clone(),
            inference: resources.inference.clone(),
            config: resources.config.snapshot(),
            events: resources.events.clone(),
            cancel,
        }
    }

    pub fn step_context(&self) -> StepContext {
        StepContext {
            job_id: self.job_id.clone(),
            db: self.db.clone(),
            storage: self.storage.clone(),
            inference: self.inference.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
        }
    }
}
