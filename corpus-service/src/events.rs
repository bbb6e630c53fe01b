//! Progress events for live clients.
//!
//! Job and step progress is published on a broadcast channel; the SSE endpoint
//! forwards it to subscribers. Publishing never blocks and never fails when
//! nobody is listening.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::db::{JobRecord, JobStatus};
use crate::pipeline::StepName;

/// Messages pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    /// A job changed status or advanced to a new step
    JobProgress {
        job_id: String,
        job_type: String,
        project_id: String,
        status: JobStatus,
        current_step: usize,
        total_steps: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A document's status flag was set
    DocumentProgress {
        document_id: String,
        job_id: String,
        step: StepName,
    },
}

impl ServiceEvent {
    pub fn job_progress(job: &JobRecord) -> Self {
        ServiceEvent::JobProgress {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            project_id: job.project_id.clone(),
            status: job.status,
            current_step: job.current_step,
            total_steps: job.steps.len(),
            error: job.error.clone(),
        }
    }

    /// SSE event name
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceEvent::JobProgress { .. } => "job_progress",
            ServiceEvent::DocumentProgress { .. } => "document_progress",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: ServiceEvent) {
        // Err only means nobody is subscribed
        if let Ok(receivers) = self.sender.send(event) {
            debug!(receivers, "Published event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
