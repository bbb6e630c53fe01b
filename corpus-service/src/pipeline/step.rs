//! The step abstraction.

use std::sync::Arc;

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tokio_util::sync::CancellationToken;

use super::cargo::{Cargo, CargoKey};
use crate::config::DynamicConfig;
use crate::db::Database;
use crate::error::{StepError, StepResult};
use crate::events::EventBus;
use crate::inference::Inference;
use crate::storage::FileStore;

/// Name of a pipeline step; doubles as the status flag name
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepName {
    Import,
    Transcode,
    ExtractAudio,
    Transcribe,
    Clean,
    ExtractText,
    LanguageDetect,
    Annotate,
    Embed,
    ObjectDetect,
    Persist,
    Index,
}

/// Services available to steps for the duration of one job run
#[derive(Clone)]
pub struct StepContext {
    pub job_id: String,
    pub db: Arc<Database>,
    pub storage: Arc<FileStore>,
    pub inference: Arc<dyn Inference>,
    /// Settings snapshot taken when the job started
    pub config: Arc<DynamicConfig>,
    pub cancel: CancellationToken,
    pub events: EventBus,
}

impl StepContext {
    pub fn check_cancelled(&self) -> StepResult<()> {
        if self.cancel.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A unit of work applied to one cargo.
///
/// Steps must be safe to re-run: a retry starts the chain from the first step
/// again, so writes are exists-or-create or delete-then-insert.
pub trait Step: Send + Sync {
    fn name(&self) -> StepName;

    /// Keys that must be present before the step runs
    fn requires(&self) -> &'static [CargoKey];

    /// Keys the step writes
    fn produces(&self) -> &'static [CargoKey];

    fn run<'a>(&'a self, ctx: &'a StepContext, cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>>;
}

/// A subject that dropped out of the chain
#[derive(Debug)]
pub struct SubjectFailure {
    pub subject_id: String,
    pub step: StepName,
    pub error: StepError,
}

pub type SubjectResult = Result<Cargo, SubjectFailure>;

/// A step that processes items from all live subjects in shared batches
pub trait BatchStep: Send + Sync {
    fn name(&self) -> StepName;

    fn requires(&self) -> &'static [CargoKey];

    fn produces(&self) -> &'static [CargoKey];

    /// One result per input cargo, in any order
    fn run_batch<'a>(
        &'a self,
        ctx: &'a StepContext,
        cargos: Vec<Cargo>,
    ) -> BoxFuture<'a, Vec<SubjectResult>>;
}

/// Entry in a pipeline definition. Cloning shares the step.
#[derive(Clone)]
pub enum PipelineStep {
    Single(Arc<dyn Step>),
    Batched(Arc<dyn BatchStep>),
}

impl PipelineStep {
    pub fn name(&self) -> StepName {
        match self {
            PipelineStep::Single(step) => step.name(),
            PipelineStep::Batched(step) => step.name(),
        }
    }

    pub fn requires(&self) -> &'static [CargoKey] {
        match self {
            PipelineStep::Single(step) => step.requires(),
            PipelineStep::Batched(step) => step.requires(),
        }
    }

    pub fn produces(&self) -> &'static [CargoKey] {
        match self {
            PipelineStep::Single(step) => step.produces(),
            PipelineStep::Batched(step) => step.produces(),
        }
    }
}

impl std::fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStep::Single(_) => write!(f, "Single({})", self.name()),
            PipelineStep::Batched(_) => write!(f, "Batched({})", self.name()),
        }
    }
}
