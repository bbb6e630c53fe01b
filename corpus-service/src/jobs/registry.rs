//! Process-wide table of job types.
//!
//! Handlers are written against typed input and output structs; the registry
//! erases them behind JSON so the runner and the HTTP surface can treat every
//! job type the same way.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::JobContext;
use crate::db::{ConcurrencyClass, Database, JobPriority, JobRecord, JobStatus};
use crate::error::{JobError, JobResult, RegistryError, ServiceError, ServiceResult};
use crate::pipeline::StepName;

/// Common fields every job input carries
pub trait JobInput {
    fn project_id(&self) -> &str;

    /// Checks beyond what deserialization enforces
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Typed job implementation
pub trait JobHandler: Send + Sync + 'static {
    type Input: JobInput + DeserializeOwned + JsonSchema + Send + 'static;
    type Output: Serialize + JsonSchema + Send + 'static;

    /// The returned future is spawned, so it must own everything it uses
    fn handle(&self, ctx: JobContext, input: Self::Input) -> BoxFuture<'static, JobResult<Self::Output>>;
}

/// Rebuilds a full job input from the identifying fields of a reference.
///
/// Enrichers only read persisted state; enriching the same reference twice
/// yields the same input.
pub trait Enricher: Send + Sync + 'static {
    type Reference: DeserializeOwned;
    type Input: Serialize;

    fn enrich(&self, db: &Database, reference: Self::Reference) -> ServiceResult<Self::Input>;
}

// ==================== Type erasure ====================

trait ErasedHandler: Send + Sync {
    fn parse(&self, payload: &serde_json::Value) -> Result<String, String>;

    fn call(&self, ctx: JobContext, payload: serde_json::Value) -> BoxFuture<'static, JobResult<serde_json::Value>>;
}

struct TypedHandler<H>(Arc<H>);

impl<H: JobHandler> ErasedHandler for TypedHandler<H> {
    /// Deserialize and validate, returning the project id
    fn parse(&self, payload: &serde_json::Value) -> Result<String, String> {
        let input = H::Input::deserialize(payload).map_err(|e| e.to_string())?;
        input.validate()?;
        Ok(input.project_id().to_string())
    }

    fn call(&self, ctx: JobContext, payload: serde_json::Value) -> BoxFuture<'static, JobResult<serde_json::Value>> {
        let input = match serde_json::from_value::<H::Input>(payload) {
            Ok(input) => input,
            Err(e) => {
                return futures::future::ready(Err(JobError::InvalidInput {
                    message: e.to_string(),
                }))
                .boxed();
            }
        };

        let handler = self.0.clone();
        async move {
            let output = handler.handle(ctx, input).await?;
            serde_json::to_value(output).map_err(|e| JobError::permanent(format!("unserializable output: {e}")))
        }
        .boxed()
    }
}

trait ErasedEnricher: Send + Sync {
    fn enrich(&self, db: &Database, reference: &serde_json::Value) -> ServiceResult<serde_json::Value>;
}

struct TypedEnricher<E>(E);

impl<E: Enricher> ErasedEnricher for TypedEnricher<E> {
    fn enrich(&self, db: &Database, reference: &serde_json::Value) -> ServiceResult<serde_json::Value> {
        let reference = E::Reference::deserialize(reference).map_err(|e| ServiceError::InvalidRequest {
            message: format!("invalid reference: {e}"),
        })?;
        let input = self.0.enrich(db, reference)?;
        serde_json::to_value(input).map_err(|e| ServiceError::Internal {
            message: format!("enriched input is not serializable: {e}"),
        })
    }
}

// ==================== Descriptors ====================

/// A job type: handler, schemas and execution policy
pub struct JobDescriptor {
    job_type: String,
    handler: Arc<dyn ErasedHandler>,
    enricher: Option<Arc<dyn ErasedEnricher>>,
    input_schema: serde_json::Value,
    output_schema: serde_json::Value,
    priority: JobPriority,
    max_retries: u32,
    concurrency_class: ConcurrencyClass,
    timeout: Option<Duration>,
    steps: Vec<StepName>,
}

/// Payload that passed validation
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub payload: serde_json::Value,
    pub project_id: String,
}

/// Public summary of a registered job type
#[derive(Debug, Clone, Serialize)]
pub struct JobTypeInfo {
    pub job_type: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub priority: JobPriority,
    pub concurrency_class: ConcurrencyClass,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub steps: Vec<StepName>,
    pub enrichable: bool,
}

fn schema_value<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
}

impl JobDescriptor {
    pub fn new<H: JobHandler>(job_type: impl Into<String>, handler: H) -> Self {
        Self {
            job_type: job_type.into(),
            handler: Arc::new(TypedHandler(Arc::new(handler))),
            enricher: None,
            input_schema: schema_value::<H::Input>(),
            output_schema: schema_value::<H::Output>(),
            priority: JobPriority::Default,
            max_retries: 3,
            concurrency_class: ConcurrencyClass::Cpu,
            timeout: None,
            steps: Vec::new(),
        }
    }

    pub fn enricher(mut self, enricher: impl Enricher) -> Self {
        self.enricher = Some(Arc::new(TypedEnricher(enricher)));
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn concurrency_class(mut self, class: ConcurrencyClass) -> Self {
        self.concurrency_class = class;
        self
    }

    /// Overrides the runner's default job timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn steps(mut self, steps: Vec<StepName>) -> Self {
        self.steps = steps;
        self
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn step_names(&self) -> &[StepName] {
        &self.steps
    }

    pub fn is_enrichable(&self) -> bool {
        self.enricher.is_some()
    }

    /// Validate a payload against the typed input
    pub fn prepare(&self, payload: serde_json::Value) -> Result<PreparedInput, RegistryError> {
        let project_id = self
            .handler
            .parse(&payload)
            .map_err(|message| RegistryError::InvalidJobInput {
                job_type: self.job_type.clone(),
                message,
            })?;
        Ok(PreparedInput { payload, project_id })
    }

    /// Turn a reference payload into a validated full input
    pub fn enrich(&self, db: &Database, reference: &serde_json::Value) -> ServiceResult<PreparedInput> {
        let Some(enricher) = &self.enricher else {
            return Err(RegistryError::InvalidJobInput {
                job_type: self.job_type.clone(),
                message: "job type does not accept references".to_string(),
            }
            .into());
        };

        let payload = enricher.enrich(db, reference).map_err(|e| match e {
            ServiceError::InvalidRequest { message } => RegistryError::InvalidJobInput {
                job_type: self.job_type.clone(),
                message,
            }
            .into(),
            other => other,
        })?;
        Ok(self.prepare(payload)?)
    }

    /// A fresh queued record for a prepared input
    pub fn new_job(&self, input: PreparedInput) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: Uuid::new_v4().to_string(),
            job_type: self.job_type.clone(),
            status: JobStatus::Queued,
            priority: self.priority,
            concurrency_class: self.concurrency_class,
            project_id: input.project_id,
            input: input.payload,
            output: None,
            error: None,
            current_step: 0,
            steps: self.steps.iter().map(ToString::to_string).collect(),
            retry_count: 0,
            max_retries: self.max_retries,
            next_run_at: now,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn invoke(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> BoxFuture<'static, JobResult<serde_json::Value>> {
        self.handler.call(ctx, payload)
    }

    pub fn info(&self) -> JobTypeInfo {
        JobTypeInfo {
            job_type: self.job_type.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
            priority: self.priority,
            concurrency_class: self.concurrency_class,
            max_retries: self.max_retries,
            timeout_secs: self.timeout.map(|t| t.as_secs()),
            steps: self.steps.clone(),
            enrichable: self.enricher.is_some(),
        }
    }
}

/// Append-only map of job type name to descriptor
#[derive(Default)]
pub struct JobRegistry {
    types: DashMap<String, Arc<JobDescriptor>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: JobDescriptor) -> Result<(), RegistryError> {
        match self.types.entry(descriptor.job_type.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateJobType {
                job_type: descriptor.job_type,
            }),
            Entry::Vacant(slot) => {
                tracing::debug!(job_type = %descriptor.job_type, "Registered job type");
                slot.insert(Arc::new(descriptor));
                Ok(())
            }
        }
    }

    pub fn resolve(&self, job_type: &str) -> Result<Arc<JobDescriptor>, RegistryError> {
        self.types
            .get(job_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::UnknownJobType {
                job_type: job_type.to_string(),
            })
    }

    /// Resolve and validate in one go; used at enqueue time
    pub fn validate(&self, job_type: &str, payload: serde_json::Value) -> Result<PreparedInput, RegistryError> {
        self.resolve(job_type)?.prepare(payload)
    }

    /// Registered types sorted by name
    pub fn job_types(&self) -> Vec<JobTypeInfo> {
        let mut types: Vec<JobTypeInfo> = self.types.iter().map(|entry| entry.value().info()).collect();
        types.sort_by(|a, b| a.job_type.cmp(&b.job_type));
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct EchoInput {
        project_id: String,
        words: Vec<String>,
    }

    impl JobInput for EchoInput {
        fn project_id(&self) -> &str {
            &self.project_id
        }

        fn validate(&self) -> Result<(), String> {
            if self.words.is_empty() {
                Err("words must not be empty".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[derive(Serialize, JsonSchema)]
    struct EchoOutput {
        joined: String,
    }

    struct Echo;

    impl JobHandler for Echo {
        type Input = EchoInput;
        type Output = EchoOutput;

        fn handle(&self, _ctx: JobContext, input: EchoInput) -> BoxFuture<'static, JobResult<EchoOutput>> {
            async move {
                Ok(EchoOutput {
                    joined: input.words.join(" "),
                })
            }
            .boxed()
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = JobRegistry::new();
        registry.register(JobDescriptor::new("echo", Echo)).unwrap();

        let err = registry.register(JobDescriptor::new("echo", Echo)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateJobType { job_type } if job_type == "echo"));
    }

    #[test]
    fn test_unknown_job_type() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(RegistryError::UnknownJobType { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_payloads() {
        let registry = JobRegistry::new();
        registry.register(JobDescriptor::new("echo", Echo)).unwrap();

        let prepared = registry
            .validate("echo", json!({"project_id": "p1", "words": ["a"]}))
            .unwrap();
        assert_eq!(prepared.project_id, "p1");

        assert!(matches!(
            registry.validate("echo", json!({"project_id": "p1"})),
            Err(RegistryError::InvalidJobInput { .. })
        ));
        assert!(matches!(
            registry.validate("echo", json!({"project_id": "p1", "words": []})),
            Err(RegistryError::InvalidJobInput { message, .. }) if message.contains("empty")
        ));
    }

    #[test]
    fn test_descriptor_info_carries_policy_and_schema() {
        let registry = JobRegistry::new();
        registry
            .register(
                JobDescriptor::new("echo", Echo)
                    .priority(JobPriority::High)
                    .max_retries(5)
                    .concurrency_class(ConcurrencyClass::Gpu)
                    .timeout(Duration::from_secs(30)),
            )
            .unwrap();

        let info = &registry.job_types()[0];
        assert_eq!(info.priority, JobPriority::High);
        assert_eq!(info.max_retries, 5);
        assert_eq!(info.concurrency_class, ConcurrencyClass::Gpu);
        assert_eq!(info.timeout_secs, Some(30));
        assert!(info.input_schema["properties"]["words"].is_object());
        assert!(!info.enrichable);
    }

    #[test]
    fn test_new_job_is_queued_with_policy() {
        let descriptor = JobDescriptor::new("echo", Echo)
            .max_retries(2)
            .steps(vec![StepName::Import, StepName::Index]);
        let prepared = descriptor
            .prepare(json!({"project_id": "p9", "words": ["x"]}))
            .unwrap();

        let job = descriptor.new_job(prepared);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.project_id, "p9");
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.steps, vec!["import", "index"]);
    }

    #[test]
    fn test_enrich_without_enricher_is_invalid_input() {
        let db = Database::open_in_memory().unwrap();
        let descriptor = JobDescriptor::new("echo", Echo);

        let err = descriptor.enrich(&db, &json!({"project_id": "p1"})).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Registry(RegistryError::InvalidJobInput { .. })
        ));
    }
}
