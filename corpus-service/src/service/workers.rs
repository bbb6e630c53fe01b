//! Background tasks: worker pools and job retention.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::ConcurrencyClass;
use crate::error::ServiceResult;
use crate::service::CorpusService;

impl CorpusService {
    /// Fail and requeue jobs a previous process left running.
    /// Call once on startup, before the workers start.
    pub fn recover_interrupted_jobs(&self) -> ServiceResult<usize> {
        let recovered = self.runner.recover_interrupted()?;
        if recovered > 0 {
            warn!(recovered, "Recovered interrupted jobs");
        }
        Ok(recovered)
    }

    /// Start the configured number of workers for each concurrency class
    pub fn start_workers(service: Arc<CorpusService>) -> Vec<JoinHandle<()>> {
        let workers = service.runtime_config.static_config.workers.clone();
        let mut handles = Vec::with_capacity(workers.cpu + workers.gpu);

        for (class, count) in [
            (ConcurrencyClass::Cpu, workers.cpu),
            (ConcurrencyClass::Gpu, workers.gpu),
        ] {
            for index in 0..count {
                handles.push(Self::start_worker(service.clone(), class, index));
            }
        }

        handles
    }

    fn start_worker(service: Arc<CorpusService>, class: ConcurrencyClass, index: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(class = %class, worker = index, "Job worker started");
            loop {
                if service.shutdown.is_cancelled() {
                    break;
                }

                let poll_interval = service.runtime_config.dynamic().runner.poll_interval();
                match service.runner.run_next(class).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        tokio::select! {
                            _ = service.queue.wait(class, poll_interval) => {}
                            _ = service.shutdown.cancelled() => break,
                        }
                    }
                    Err(e) => {
                        error!(class = %class, worker = index, error = %e, "Failed to claim job");
                        tokio::select! {
                            _ = tokio::time::sleep(poll_interval) => {}
                            _ = service.shutdown.cancelled() => break,
                        }
                    }
                }
            }
            info!(class = %class, worker = index, "Job worker stopped");
        })
    }

    /// Delete terminal jobs older than the retention TTL
    pub fn cleanup_expired_jobs(&self) -> ServiceResult<usize> {
        let ttl = self.runtime_config.dynamic().retention.job_ttl();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(30));
        self.db.delete_terminal_jobs_before(cutoff)
    }

    /// Periodically run [`CorpusService::cleanup_expired_jobs`]
    pub fn start_retention_task(service: Arc<CorpusService>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Job retention task started");
            loop {
                let interval = service.runtime_config.dynamic().retention.cleanup_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = service.shutdown.cancelled() => break,
                }

                match service.cleanup_expired_jobs() {
                    Ok(0) => {}
                    Ok(deleted) => info!(deleted, "Deleted expired jobs"),
                    Err(e) => error!(error = %e, "Job retention cleanup failed"),
                }
            }
        })
    }
}
