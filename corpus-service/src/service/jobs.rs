//! Generic job operations: start, poll, abort, retry, list.
//!
//! These work for every registered job type through the registry; nothing
//! here knows about specific handlers.

use chrono::Utc;
use tracing::info;

use crate::db::{JobRecord, JobStatus};
use crate::error::{ServiceError, ServiceResult};
use crate::events::ServiceEvent;
use crate::jobs::{JobTypeInfo, PreparedInput};
use crate::service::CorpusService;

impl CorpusService {
    pub fn job_types(&self) -> Vec<JobTypeInfo> {
        self.registry.job_types()
    }

    /// Validate `payload` against the job type and enqueue it
    pub fn start_job(&self, job_type: &str, payload: serde_json::Value) -> ServiceResult<JobRecord> {
        let prepared = self.registry.validate(job_type, payload)?;
        self.enqueue_prepared(job_type, prepared)
    }

    /// Enqueue from a reference payload, letting the job type's enricher
    /// fill in the rest from persisted state
    pub fn start_job_from_reference(
        &self,
        job_type: &str,
        reference: &serde_json::Value,
    ) -> ServiceResult<JobRecord> {
        let descriptor = self.registry.resolve(job_type)?;
        let prepared = descriptor.enrich(&self.db, reference)?;
        self.enqueue_prepared(job_type, prepared)
    }

    pub(crate) fn enqueue_prepared(&self, job_type: &str, prepared: PreparedInput) -> ServiceResult<JobRecord> {
        let descriptor = self.registry.resolve(job_type)?;
        let job = descriptor.new_job(prepared);
        self.queue.enqueue(&job)?;

        info!(job_id = %job.id, job_type = %job_type, project_id = %job.project_id, "Job queued");
        self.events.publish(ServiceEvent::job_progress(&job));
        Ok(job)
    }

    /// Fetch a job, checking it belongs to `job_type`
    pub fn get_job(&self, job_type: &str, job_id: &str) -> ServiceResult<JobRecord> {
        self.registry.resolve(job_type)?;
        self.db
            .get_job(job_id)?
            .filter(|job| job.job_type == job_type)
            .ok_or_else(|| ServiceError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Abort a queued or running job. A running handler stops at its next
    /// step boundary.
    pub fn abort_job(&self, job_type: &str, job_id: &str) -> ServiceResult<JobRecord> {
        self.get_job(job_type, job_id)?;
        let job = self.db.abort_job(job_id)?;
        self.cancellations.cancel(job_id);

        info!(job_id = %job_id, "Job aborted");
        self.events.publish(ServiceEvent::job_progress(&job));
        Ok(job)
    }

    /// Requeue an errored job for another attempt from the first step.
    /// Manual retries draw on the same `max_retries` budget as automatic ones.
    ///
    /// Enrichable job types have their input rebuilt from persisted state
    /// first, so the retry sees current document data.
    pub fn retry_job(&self, job_type: &str, job_id: &str) -> ServiceResult<JobRecord> {
        let job = self.get_job(job_type, job_id)?;
        if job.status != JobStatus::Errored {
            return Err(ServiceError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Queued,
            });
        }
        if job.retry_count >= job.max_retries {
            return Err(ServiceError::RetryBudgetExhausted {
                job_id: job_id.to_string(),
                max_retries: job.max_retries,
            });
        }

        let descriptor = self.registry.resolve(job_type)?;
        if descriptor.is_enrichable() {
            let prepared = descriptor.enrich(&self.db, &job.input)?;
            self.db.update_job_input(job_id, &prepared.payload)?;
        }

        let job = self.queue.requeue(&job, job.retry_count + 1, Utc::now())?;
        info!(job_id = %job_id, retry_count = job.retry_count, "Job retry requested");
        self.events.publish(ServiceEvent::job_progress(&job));
        Ok(job)
    }

    /// Jobs of one type for a project, newest first
    pub fn list_jobs(&self, job_type: &str, project_id: &str) -> ServiceResult<Vec<JobRecord>> {
        self.registry.resolve(job_type)?;
        self.db.list_jobs(job_type, project_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ConcurrencyClass;
    use crate::error::RegistryError;
    use crate::jobs::JobOutcome;
    use crate::testing::TestHarness;
    use serde_json::json;

    #[test]
    fn test_start_validates_at_enqueue_time() {
        let harness = TestHarness::new();
        let service = harness.service();

        let err = service
            .start_job("detect_language", json!({"project_id": "p1"}))
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Registry(RegistryError::InvalidJobInput { .. })
        ));

        let err = service.start_job("nope", json!({})).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Registry(RegistryError::UnknownJobType { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_poll_and_list() {
        let harness = TestHarness::new();
        let service = harness.service();

        let first = service
            .start_job("detect_language", json!({"project_id": "p1", "text": "Hello there"}))
            .unwrap();
        let second = service
            .start_job("detect_language", json!({"project_id": "p1", "text": "Bonjour"}))
            .unwrap();
        assert_eq!(first.status, JobStatus::Queued);

        let listed: Vec<String> = service
            .list_jobs("detect_language", "p1")
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(listed, vec![second.id.clone(), first.id.clone()]);

        let outcome = service.runner.run_next(ConcurrencyClass::Cpu).await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Finished));

        // Wrong type is not found
        assert!(matches!(
            service.get_job("text_pipeline", &first.id),
            Err(ServiceError::JobNotFound { .. })
        ));
    }

    #[test]
    fn test_abort_queued_job() {
        let harness = TestHarness::new();
        let service = harness.service();
        let job = service
            .start_job("detect_language", json!({"project_id": "p1", "text": "Hello"}))
            .unwrap();

        let aborted = service.abort_job("detect_language", &job.id).unwrap();
        assert_eq!(aborted.status, JobStatus::Aborted);

        // Terminal
        assert!(matches!(
            service.abort_job("detect_language", &job.id),
            Err(ServiceError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_retry_only_from_errored() {
        let harness = TestHarness::new();
        let service = harness.service();
        let job = service
            .start_job("detect_language", json!({"project_id": "p1", "text": "Hello"}))
            .unwrap();

        assert!(matches!(
            service.retry_job("detect_language", &job.id),
            Err(ServiceError::InvalidTransition {
                from: JobStatus::Queued,
                ..
            })
        ));

        harness.db.make_dispatchable(&job.id);
        let weights = service.runtime_config.dynamic().scheduling.clone();
        service.queue.dequeue(ConcurrencyClass::Cpu, &weights).unwrap().unwrap();
        harness.db.fail_job(&job.id, "boom").unwrap();

        let retried = service.retry_job("detect_language", &job.id).unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.retry_count, 1);
    }

    #[test]
    fn test_retry_is_bounded_by_max_retries() {
        let harness = TestHarness::new();
        let service = harness.service();
        let job = service
            .start_job("detect_language", json!({"project_id": "p1", "text": "Hello"}))
            .unwrap();
        let weights = service.runtime_config.dynamic().scheduling.clone();

        // detect_language allows two retries
        for expected in 1..=2 {
            harness.db.make_dispatchable(&job.id);
            service.queue.dequeue(ConcurrencyClass::Cpu, &weights).unwrap().unwrap();
            harness.db.fail_job(&job.id, "boom").unwrap();
            let retried = service.retry_job("detect_language", &job.id).unwrap();
            assert_eq!(retried.retry_count, expected);
        }

        harness.db.make_dispatchable(&job.id);
        service.queue.dequeue(ConcurrencyClass::Cpu, &weights).unwrap().unwrap();
        harness.db.fail_job(&job.id, "boom").unwrap();

        assert!(matches!(
            service.retry_job("detect_language", &job.id),
            Err(ServiceError::RetryBudgetExhausted { max_retries: 2, .. })
        ));
        let job = service.get_job("detect_language", &job.id).unwrap();
        assert_eq!(job.status, JobStatus::Errored);
        assert_eq!(job.retry_count, 2);
    }
}
