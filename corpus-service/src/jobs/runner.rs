//! Executes claimed jobs and applies the retry policy.
//!
//! The runner is the only place that decides between retrying and failing a
//! job. Handlers run on their own task so a panic ends the attempt without
//! taking the worker down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{error, info, warn};

use super::cancellation::CancellationRegistry;
use super::context::{JobContext, JobResources};
use super::queue::{JobQueue, Nack};
use super::registry::JobRegistry;
use crate::config::{MAX_BACKOFF_MS, RunnerConfig};
use crate::db::{ConcurrencyClass, JobRecord, JobStatus};
use crate::error::{JobError, ServiceError, ServiceResult, format_error_chain};
use crate::events::ServiceEvent;

/// How a single attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Finished,
    /// Failed and put back on the queue
    Retrying {
        retry_count: u32,
        next_run_at: DateTime<Utc>,
    },
    Errored,
    Aborted,
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Finished => "finished",
            JobOutcome::Retrying { .. } => "retrying",
            JobOutcome::Errored => "errored",
            JobOutcome::Aborted => "aborted",
        }
    }
}

/// Exponential backoff with up to 25% jitter, capped at `backoff_max`
pub fn backoff_delay(config: &RunnerConfig, retry_count: u32) -> Duration {
    let base = config.backoff_base();
    let exponential = base.saturating_mul(2u32.saturating_pow(retry_count.min(16)));
    let capped = exponential.min(config.backoff_max());
    let jitter: f64 = rand::thread_rng().gen_range(0.0..=0.25);
    capped.saturating_add(capped.mul_f64(jitter))
}

/// When a job delayed by `delay` becomes dispatchable again. Delays past
/// what a timestamp can hold fall back to the largest allowed backoff.
fn retry_at(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or_else(|| now + chrono::Duration::milliseconds(MAX_BACKOFF_MS as i64))
}

pub struct JobRunner {
    registry: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    cancellations: Arc<CancellationRegistry>,
    resources: JobResources,
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        queue: Arc<JobQueue>,
        cancellations: Arc<CancellationRegistry>,
        resources: JobResources,
    ) -> Self {
        Self {
            registry,
            queue,
            cancellations,
            resources,
        }
    }

    /// Claim and run one job of `class`; `None` when nothing is dispatchable
    pub async fn run_next(&self, class: ConcurrencyClass) -> ServiceResult<Option<JobOutcome>> {
        let weights = self.resources.config.dynamic().scheduling.clone();
        let Some(job) = self.queue.dequeue(class, &weights)? else {
            return Ok(None);
        };
        self.publish(&job);
        Ok(Some(self.run(job).await))
    }

    /// Run a claimed (`Running`) job to the end of this attempt
    pub async fn run(&self, job: JobRecord) -> JobOutcome {
        let started = Instant::now();
        info!(job_id = %job.id, job_type = %job.job_type, attempt = job.retry_count + 1, "Running job");

        let result = self.attempt(&job).await;
        let outcome = self.settle(&job, result);

        metrics::counter!("corpus_jobs_total", "job_type" => job.job_type.clone(), "outcome" => outcome.label())
            .increment(1);
        metrics::histogram!("corpus_job_duration_seconds", "job_type" => job.job_type.clone())
            .record(started.elapsed().as_secs_f64());

        outcome
    }

    async fn attempt(&self, job: &JobRecord) -> Result<serde_json::Value, JobError> {
        let descriptor = self.registry.resolve(&job.job_type).map_err(|e| JobError::InvalidInput {
            message: e.to_string(),
        })?;

        let timeout = descriptor
            .timeout_override()
            .unwrap_or_else(|| self.resources.config.dynamic().runner.job_timeout());

        let token = self.cancellations.register(&job.id);
        // An abort between the claim and `register` found no token to cancel
        if self.aborted_before_start(&job.id) {
            self.cancellations.unregister(&job.id);
            return Err(JobError::Cancelled);
        }

        let ctx = JobContext::new(job, &self.resources, token.clone());
        let mut handle = tokio::spawn(descriptor.invoke(ctx, job.input.clone()));

        let result = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => {
                let panic = join_error.into_panic();
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(job_id = %job.id, panic = %detail, "Job handler panicked");
                Err(JobError::transient(self.resources.i18n.get("en", "job-panicked", None)))
            }
            Ok(Err(_)) => Err(JobError::Cancelled),
            Err(_) => {
                token.cancel();
                handle.abort();
                Err(JobError::Timeout { timeout })
            }
        };

        self.cancellations.unregister(&job.id);
        result
    }

    fn aborted_before_start(&self, job_id: &str) -> bool {
        match self.resources.db.get_job(job_id) {
            Ok(Some(record)) => record.status == JobStatus::Aborted,
            Ok(None) => false,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to reload claimed job");
                false
            }
        }
    }

    /// Record the attempt's result and decide what happens next
    fn settle(&self, job: &JobRecord, result: Result<serde_json::Value, JobError>) -> JobOutcome {
        let recorded = match result {
            Ok(output) => self.queue.ack(&job.id, &output).map(|record| (record, JobOutcome::Finished)),
            Err(JobError::Cancelled) => return self.confirm_aborted(job),
            Err(error) => {
                let message = format_error_chain(&error);
                let retry = error.is_retryable() && job.retry_count < job.max_retries;
                let action = if retry {
                    let delay = backoff_delay(&self.resources.config.dynamic().runner, job.retry_count);
                    Nack::Requeue {
                        retry_count: job.retry_count + 1,
                        next_run_at: retry_at(delay),
                    }
                } else {
                    Nack::Fail
                };

                warn!(job_id = %job.id, error = %message, retry, "Job attempt failed");
                self.queue.nack(&job.id, &message, action).map(|record| {
                    let outcome = match action {
                        Nack::Requeue {
                            retry_count,
                            next_run_at,
                        } => JobOutcome::Retrying {
                            retry_count,
                            next_run_at,
                        },
                        Nack::Fail => JobOutcome::Errored,
                    };
                    (record, outcome)
                })
            }
        };

        match recorded {
            Ok((record, outcome)) => {
                info!(job_id = %job.id, status = %record.status, "Job attempt ended");
                self.publish(&record);
                outcome
            }
            // Aborted while the handler was finishing
            Err(ServiceError::InvalidTransition {
                from: JobStatus::Aborted,
                ..
            }) => JobOutcome::Aborted,
            Err(e) => {
                error!(job_id = %job.id, error = %format_error_chain(&e), "Failed to record job result");
                JobOutcome::Errored
            }
        }
    }

    /// A handler stopped on its token; make sure the row says so
    fn confirm_aborted(&self, job: &JobRecord) -> JobOutcome {
        match self.resources.db.get_job(&job.id) {
            Ok(Some(record)) if record.status == JobStatus::Aborted => {}
            Ok(_) => match self.resources.db.abort_job(&job.id) {
                Ok(record) => self.publish(&record),
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to mark cancelled job aborted"),
            },
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to load cancelled job"),
        }
        JobOutcome::Aborted
    }

    /// Jobs left `Running` by a previous process are failed as interrupted and
    /// requeued under the normal retry policy
    pub fn recover_interrupted(&self) -> ServiceResult<usize> {
        let interrupted = self.resources.db.jobs_with_status(JobStatus::Running)?;
        let message = self.resources.i18n.get("en", "job-interrupted", None);
        let runner = self.resources.config.dynamic().runner.clone();

        for job in &interrupted {
            let action = if job.retry_count < job.max_retries {
                Nack::Requeue {
                    retry_count: job.retry_count + 1,
                    next_run_at: retry_at(backoff_delay(&runner, job.retry_count)),
                }
            } else {
                Nack::Fail
            };
            let record = self.queue.nack(&job.id, &message, action)?;
            warn!(job_id = %job.id, status = %record.status, "Recovered interrupted job");
        }

        Ok(interrupted.len())
    }

    fn publish(&self, job: &JobRecord) {
        self.resources.events.publish(ServiceEvent::job_progress(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobResult;
    use crate::jobs::{JobDescriptor, JobHandler, JobInput};
    use crate::testing::TestHarness;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Deserialize, JsonSchema)]
    struct Input {
        project_id: String,
    }

    impl JobInput for Input {
        fn project_id(&self) -> &str {
            &self.project_id
        }
    }

    #[derive(Serialize, JsonSchema)]
    struct Output {
        attempts: u32,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Transient,
        Permanent,
        Panic,
        Hang,
        WaitForCancel,
    }

    struct Scripted {
        behaviour: Behaviour,
        calls: Arc<AtomicU32>,
    }

    impl JobHandler for Scripted {
        type Input = Input;
        type Output = Output;

        fn handle(&self, ctx: JobContext, _input: Input) -> BoxFuture<'static, JobResult<Output>> {
            let attempts = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let behaviour = self.behaviour;
            async move {
                match behaviour {
                    Behaviour::Succeed => Ok(Output { attempts }),
                    Behaviour::Transient => Err(JobError::transient("inference unavailable")),
                    Behaviour::Permanent => Err(JobError::permanent("unsupported language")),
                    Behaviour::Panic => panic!("boom"),
                    Behaviour::Hang => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(Output { attempts })
                    }
                    Behaviour::WaitForCancel => {
                        ctx.cancel.cancelled().await;
                        Err(JobError::Cancelled)
                    }
                }
            }
            .boxed()
        }
    }

    struct Fixture {
        harness: TestHarness,
        runner: JobRunner,
        queue: Arc<JobQueue>,
        cancellations: Arc<CancellationRegistry>,
        calls: Arc<AtomicU32>,
    }

    fn fixture(behaviour: Behaviour, descriptor: impl FnOnce(JobDescriptor) -> JobDescriptor) -> Fixture {
        fixture_in(TestHarness::new(), behaviour, descriptor)
    }

    fn fixture_in(
        harness: TestHarness,
        behaviour: Behaviour,
        descriptor: impl FnOnce(JobDescriptor) -> JobDescriptor,
    ) -> Fixture {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(JobRegistry::new());
        registry
            .register(descriptor(JobDescriptor::new(
                "scripted",
                Scripted {
                    behaviour,
                    calls: calls.clone(),
                },
            )))
            .unwrap();

        let queue = Arc::new(JobQueue::new(harness.db.clone()));
        let cancellations = Arc::new(CancellationRegistry::new());
        let runner = JobRunner::new(
            registry.clone(),
            queue.clone(),
            cancellations.clone(),
            harness.resources(),
        );

        let prepared = registry.validate("scripted", json!({"project_id": "p1"})).unwrap();
        let job = registry.resolve("scripted").unwrap().new_job(prepared);
        let job = JobRecord {
            id: "j1".to_string(),
            ..job
        };
        queue.enqueue(&job).unwrap();

        Fixture {
            harness,
            runner,
            queue,
            cancellations,
            calls,
        }
    }

    /// Claim j1 regardless of backoff
    fn claim(fixture: &Fixture) -> JobRecord {
        fixture.harness.db.make_dispatchable("j1");
        let weights = crate::config::DynamicConfig::default().scheduling;
        fixture
            .queue
            .dequeue(ConcurrencyClass::Cpu, &weights)
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_stores_output() {
        let f = fixture(Behaviour::Succeed, |d| d);

        let outcome = f.runner.run_next(ConcurrencyClass::Cpu).await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Finished));

        let job = f.harness.db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.output, Some(json!({"attempts": 1})));
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_bound_is_max_retries_plus_one() {
        let f = fixture(Behaviour::Transient, |d| d.max_retries(2));

        let mut outcomes = Vec::new();
        loop {
            let outcome = f.runner.run(claim(&f)).await;
            let done = outcome == JobOutcome::Errored;
            outcomes.push(outcome);
            if done {
                break;
            }
            assert!(outcomes.len() < 10, "runaway retries");
        }

        assert_eq!(outcomes.len(), 3);
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
        let job = f.harness.db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Errored);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.error.as_deref(), Some("inference unavailable"));
    }

    #[tokio::test]
    async fn test_retry_sets_backoff() {
        let f = fixture(Behaviour::Transient, |d| d);
        let before = Utc::now();

        let outcome = f.runner.run(claim(&f)).await;
        let JobOutcome::Retrying {
            retry_count,
            next_run_at,
        } = outcome
        else {
            panic!("expected a retry, got {outcome:?}");
        };
        assert_eq!(retry_count, 1);
        assert!(next_run_at >= before + chrono::Duration::seconds(2));

        let job = f.harness.db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        // Not dispatchable until the backoff passes
        assert!(f.runner.run_next(ConcurrencyClass::Cpu).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_permanent_error_ignores_budget() {
        let f = fixture(Behaviour::Permanent, |d| d.max_retries(5));

        assert_eq!(f.runner.run(claim(&f)).await, JobOutcome::Errored);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_is_retryable_and_worker_survives() {
        let f = fixture(Behaviour::Panic, |d| d.max_retries(1));

        assert!(matches!(
            f.runner.run(claim(&f)).await,
            JobOutcome::Retrying { .. }
        ));
        assert_eq!(f.runner.run(claim(&f)).await, JobOutcome::Errored);

        let job = f.harness.db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("Job handler stopped unexpectedly"));
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let f = fixture(Behaviour::Hang, |d| d.timeout(Duration::from_millis(50)).max_retries(0));

        assert_eq!(f.runner.run(claim(&f)).await, JobOutcome::Errored);
        let job = f.harness.db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("timed out after 50ms"));
    }

    #[tokio::test]
    async fn test_abort_cancels_running_handler() {
        let f = fixture(Behaviour::WaitForCancel, |d| d);
        let job = claim(&f);

        let run = f.runner.run(job);
        let abort = async {
            // Let the handler start and register its token
            while !f.cancellations.cancel("j1") {
                tokio::task::yield_now().await;
            }
            f.harness.db.abort_job("j1").unwrap();
        };
        let (outcome, ()) = tokio::join!(run, abort);

        assert_eq!(outcome, JobOutcome::Aborted);
        let job = f.harness.db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Aborted);
    }

    #[tokio::test]
    async fn test_abort_before_token_registration_skips_handler() {
        let f = fixture(Behaviour::Succeed, |d| d);
        let job = claim(&f);
        // No token is registered yet, so this cancel reaches nobody
        f.harness.db.abort_job("j1").unwrap();
        assert!(!f.cancellations.cancel("j1"));

        assert_eq!(f.runner.run(job).await, JobOutcome::Aborted);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        let job = f.harness.db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Aborted);
        assert!(job.output.is_none());
    }

    #[tokio::test]
    async fn test_unrepresentable_backoff_still_requeues() {
        let mut config = crate::config::DynamicConfig::default();
        config.runner.backoff_base_ms = 10_000_000_000_000_000;
        config.runner.backoff_max_ms = 10_000_000_000_000_000;
        let f = fixture_in(TestHarness::with_config(config), Behaviour::Transient, |d| d);

        let outcome = f.runner.run(claim(&f)).await;
        let JobOutcome::Retrying { next_run_at, .. } = outcome else {
            panic!("expected a retry, got {outcome:?}");
        };
        assert!(next_run_at <= Utc::now() + chrono::Duration::days(1));

        let job = f.harness.db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn test_recover_interrupted_requeues() {
        let f = fixture(Behaviour::Succeed, |d| d);
        claim(&f);

        assert_eq!(f.runner.recover_interrupted().unwrap(), 1);
        let job = f.harness.db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.error.as_deref(), Some("Job was interrupted by a service restart"));
    }

    #[test]
    fn test_backoff_is_capped_with_bounded_jitter() {
        let config = crate::config::DynamicConfig::default().runner;
        let first = backoff_delay(&config, 0);
        assert!(first >= config.backoff_base());
        assert!(first <= config.backoff_base().mul_f64(1.25));

        let late = backoff_delay(&config, 30);
        assert!(late >= config.backoff_max());
        assert!(late <= config.backoff_max().mul_f64(1.25));
    }
}
