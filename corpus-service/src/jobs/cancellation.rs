//! Cancellation tokens for running jobs.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<String, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a job about to run
    pub fn register(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(job_id.to_string(), token.clone());
        token
    }

    /// Cancel a running job. Returns false if it was not running here.
    pub fn cancel(&self, job_id: &str) -> bool {
        if let Some((_, token)) = self.tokens.remove(job_id) {
            token.cancel();
            info!(job_id = %job_id, "Job cancellation triggered");
            true
        } else {
            false
        }
    }

    /// Drop the token once the run is over
    pub fn unregister(&self, job_id: &str) {
        self.tokens.remove(job_id);
    }
}
