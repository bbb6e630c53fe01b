//! Job registration and execution.
//!
//! Job types are registered once at startup. Triggers validate a payload
//! against the registry and enqueue a job row; worker pools per concurrency
//! class claim rows and hand them to the [`JobRunner`].

mod builtin;
mod cancellation;
mod context;
mod queue;
mod registry;
mod runner;
mod scheduler;

pub use builtin::register_builtin_jobs;
pub use cancellation::CancellationRegistry;
pub use context::{JobContext, JobResources};
pub use queue::{JobQueue, Nack};
pub use registry::{
    Enricher, JobDescriptor, JobHandler, JobInput, JobRegistry, JobTypeInfo, PreparedInput,
};
pub use runner::{JobOutcome, JobRunner, backoff_delay};
pub use scheduler::WeightedRoundRobin;
