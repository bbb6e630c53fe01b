//! Job types the service registers at startup.

use futures::FutureExt;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::context::JobContext;
use super::registry::{JobDescriptor, JobHandler, JobInput, JobRegistry};
use crate::db::{ConcurrencyClass, JobPriority};
use crate::error::{JobError, JobResult, RegistryError};
use crate::pipeline::catalog::standard_pipelines;

/// Register the standard pipelines and the standalone jobs
pub fn register_builtin_jobs(registry: &JobRegistry) -> Result<(), RegistryError> {
    for definition in standard_pipelines() {
        registry.register_pipeline(definition)?;
    }

    registry.register(
        JobDescriptor::new("detect_language", DetectLanguageJob)
            .priority(JobPriority::High)
            .concurrency_class(ConcurrencyClass::Cpu)
            .max_retries(2),
    )
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DetectLanguageInput {
    pub project_id: String,
    pub text: String,
}

impl JobInput for DetectLanguageInput {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            Err("text must not be empty".to_string())
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct DetectLanguageOutput {
    pub language: String,
    pub confidence: f32,
    pub supported: bool,
}

/// Language identification for an ad-hoc snippet
pub struct DetectLanguageJob;

impl JobHandler for DetectLanguageJob {
    type Input = DetectLanguageInput;
    type Output = DetectLanguageOutput;

    fn handle(&self, ctx: JobContext, input: DetectLanguageInput) -> BoxFuture<'static, JobResult<DetectLanguageOutput>> {
        async move {
            if ctx.cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let detection = ctx
                .inference
                .detect_language(&input.text)
                .await
                .map_err(JobError::from)?;
            Ok(DetectLanguageOutput {
                supported: ctx.config.languages.is_supported(&detection.language),
                language: detection.language,
                confidence: detection.confidence,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JobRecord, JobStatus};
    use crate::testing::TestHarness;
    use serde_json::json;

    #[test]
    fn test_builtin_job_types() {
        let registry = JobRegistry::new();
        register_builtin_jobs(&registry).unwrap();

        let names: Vec<String> = registry.job_types().into_iter().map(|t| t.job_type).collect();
        assert_eq!(
            names,
            vec![
                "audio_pipeline",
                "detect_language",
                "image_pipeline",
                "text_pipeline",
                "video_pipeline",
            ]
        );
    }

    #[test]
    fn test_registering_twice_fails() {
        let registry = JobRegistry::new();
        register_builtin_jobs(&registry).unwrap();
        assert!(matches!(
            register_builtin_jobs(&registry),
            Err(RegistryError::DuplicateJobType { .. })
        ));
    }

    #[tokio::test]
    async fn test_detect_language_job() {
        let harness = TestHarness::new();
        harness.inference.set_language("de");
        let registry = JobRegistry::new();
        register_builtin_jobs(&registry).unwrap();

        let descriptor = registry.resolve("detect_language").unwrap();
        let input = json!({"project_id": "p1", "text": "Guten Tag"});
        let job = JobRecord {
            status: JobStatus::Running,
            ..descriptor.new_job(descriptor.prepare(input.clone()).unwrap())
        };

        let ctx = JobContext::new(&job, &harness.resources(), Default::default());
        let output = tokio_test::assert_ok!(descriptor.invoke(ctx, input).await);
        assert_eq!(output["language"], "de");
        assert_eq!(output["supported"], true);
    }
}
