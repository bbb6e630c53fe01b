//! Job queue backed by the `jobs` table.
//!
//! Queued rows are the queue. Dequeue is an atomic `Queued -> Running` claim,
//! so a job is handed to exactly one worker even across pools.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;

use super::scheduler::WeightedRoundRobin;
use crate::config::SchedulingConfig;
use crate::db::{ConcurrencyClass, Database, JobRecord};
use crate::error::ServiceResult;

/// What to do with a job whose attempt failed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Nack {
    /// Leave it errored
    Fail,
    /// Put it back with the given retry count, dispatchable from `next_run_at`
    Requeue {
        retry_count: u32,
        next_run_at: DateTime<Utc>,
    },
}

pub struct JobQueue {
    db: Arc<Database>,
    cpu: ClassQueue,
    gpu: ClassQueue,
}

#[derive(Default)]
struct ClassQueue {
    notify: Notify,
    scheduler: WeightedRoundRobin,
}

impl JobQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cpu: ClassQueue::default(),
            gpu: ClassQueue::default(),
        }
    }

    fn class(&self, class: ConcurrencyClass) -> &ClassQueue {
        match class {
            ConcurrencyClass::Cpu => &self.cpu,
            ConcurrencyClass::Gpu => &self.gpu,
        }
    }

    /// Persist a queued job and wake a worker of its class
    pub fn enqueue(&self, job: &JobRecord) -> ServiceResult<()> {
        self.db.insert_job(job)?;
        debug!(job_id = %job.id, job_type = %job.job_type, priority = %job.priority, "Enqueued job");
        self.class(job.concurrency_class).notify.notify_one();
        Ok(())
    }

    /// Claim the next dispatchable job of `class`, honouring priority weights
    pub fn dequeue(
        &self,
        class: ConcurrencyClass,
        weights: &SchedulingConfig,
    ) -> ServiceResult<Option<JobRecord>> {
        let queue = self.class(class);
        let now = Utc::now();
        for priority in queue.scheduler.preference_order(weights) {
            if let Some(job) = self.db.claim_next_job(class, priority, now)? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Wait until work may be available, or `timeout` passes
    pub async fn wait(&self, class: ConcurrencyClass, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.class(class).notify.notified()).await;
    }

    /// A running job succeeded
    pub fn ack(&self, job_id: &str, output: &serde_json::Value) -> ServiceResult<JobRecord> {
        self.db.finish_job(job_id, output)
    }

    /// A running job failed; it is marked errored and optionally requeued
    pub fn nack(&self, job_id: &str, error: &str, action: Nack) -> ServiceResult<JobRecord> {
        let failed = self.db.fail_job(job_id, error)?;
        match action {
            Nack::Fail => Ok(failed),
            Nack::Requeue {
                retry_count,
                next_run_at,
            } => self.requeue(&failed, retry_count, next_run_at),
        }
    }

    /// `Errored -> Queued`
    pub fn requeue(
        &self,
        job: &JobRecord,
        retry_count: u32,
        next_run_at: DateTime<Utc>,
    ) -> ServiceResult<JobRecord> {
        let queued = self.db.requeue_job(&job.id, retry_count, next_run_at)?;
        self.class(queued.concurrency_class).notify.notify_one();
        Ok(queued)
    }
}
