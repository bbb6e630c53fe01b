//! Document pipelines: cargo, steps, definitions and the executor that runs them.
//!
//! A pipeline is an ordered list of steps per doctype. The executor walks the
//! list over a set of cargos, advancing each document's status flags as steps
//! succeed. Pipelines are exposed to the job system through [`job`].

pub(crate) mod batch;
mod cargo;
pub mod catalog;
mod definition;
mod executor;
pub mod job;
mod step;
pub mod steps;

pub use cargo::{Cargo, CargoKey};
pub use definition::{PipelineBuilder, PipelineDefinition};
pub use executor::{ExecutionReport, execute};
pub use step::{BatchStep, PipelineStep, Step, StepContext, StepName, SubjectFailure, SubjectResult};

/// Keys every pipeline job seeds its cargos with
pub const PIPELINE_INPUT_KEYS: &[CargoKey] = &[CargoKey::Path, CargoKey::Filename, CargoKey::MimeType];
