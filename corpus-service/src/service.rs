//! Service coordinator.
//!
//! `CorpusService` owns the process-wide pieces (database, object store,
//! inference client, job registry, queue and runner) and exposes the
//! operations the HTTP layer calls. Operations are split by concern across
//! the submodules.

mod documents;
mod jobs;
mod workers;

pub use documents::Upload;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::events::EventBus;
use crate::i18n::I18n;
use crate::inference::Inference;
use crate::jobs::{
    CancellationRegistry, JobQueue, JobRegistry, JobResources, JobRunner, register_builtin_jobs,
};
use crate::storage::FileStore;

/// Main service coordinator
pub struct CorpusService {
    pub runtime_config: Arc<RuntimeConfig>,
    pub db: Arc<Database>,
    pub storage: Arc<FileStore>,
    pub inference: Arc<dyn Inference>,
    pub registry: Arc<JobRegistry>,
    pub queue: Arc<JobQueue>,
    pub runner: Arc<JobRunner>,
    pub cancellations: Arc<CancellationRegistry>,
    pub events: EventBus,
    pub i18n: Arc<I18n>,
    shutdown: CancellationToken,
}

impl CorpusService {
    /// Create a new service instance with the built-in job types registered.
    /// Accepts a pre-opened database so that RuntimeConfig can load settings from it
    pub fn new(
        db: Arc<Database>,
        runtime_config: Arc<RuntimeConfig>,
        inference: Arc<dyn Inference>,
    ) -> ServiceResult<Self> {
        info!("Initializing corpus service");

        let storage = Arc::new(FileStore::new(
            runtime_config.static_config.storage.data_dir.clone(),
        ));

        let registry = Arc::new(JobRegistry::new());
        register_builtin_jobs(&registry)?;
        info!(job_types = registry.job_types().len(), "Registered job types");

        let events = EventBus::default();
        let i18n = Arc::new(I18n::new());
        let queue = Arc::new(JobQueue::new(db.clone()));
        let cancellations = Arc::new(CancellationRegistry::new());

        let resources = JobResources {
            db: db.clone(),
            storage: storage.clone(),
            inference: inference.clone(),
            config: runtime_config.clone(),
            events: events.clone(),
            i18n: i18n.clone(),
        };
        let runner = Arc::new(JobRunner::new(
            registry.clone(),
            queue.clone(),
            cancellations.clone(),
            resources,
        ));

        Ok(Self {
            runtime_config,
            db,
            storage,
            inference,
            registry,
            queue,
            runner,
            cancellations,
            events,
            i18n,
            shutdown: CancellationToken::new(),
        })
    }

    /// Update settings and hot-reload the dynamic config.
    ///
    /// Running jobs keep the snapshot they started with.
    pub fn update_settings(&self, updates: HashMap<String, serde_json::Value>) -> ServiceResult<()> {
        let valid = crate::config::DynamicConfig::valid_keys();
        if let Some(key) = updates.keys().find(|key| !valid.contains(key.as_str())) {
            return Err(ServiceError::InvalidRequest {
                message: format!("Unknown setting: {key}"),
            });
        }

        for (key, value) in &updates {
            crate::config::DynamicConfig::validate_setting(key, value)
                .map_err(|message| ServiceError::InvalidRequest { message })?;
        }

        self.db.set_settings(&updates)?;
        self.runtime_config.reload_from_db(&self.db)?;
        info!(keys = updates.len(), "Settings updated");

        Ok(())
    }

    /// Stop background workers after their current job
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;

    #[test]
    fn test_update_settings_reloads_config() {
        let harness = TestHarness::new();
        let service = harness.service();

        let mut updates = HashMap::new();
        updates.insert("batching.embedding_batch_size".to_string(), serde_json::json!(7));
        service.update_settings(updates).unwrap();

        assert_eq!(service.runtime_config.dynamic().batching.embedding_batch_size, 7);
    }

    #[test]
    fn test_out_of_range_setting_is_rejected_and_not_stored() {
        let harness = TestHarness::new();
        let service = harness.service();

        let mut updates = HashMap::new();
        updates.insert("scheduling.high_weight".to_string(), serde_json::json!(200_000_000));
        assert!(matches!(
            service.update_settings(updates),
            Err(ServiceError::InvalidRequest { .. })
        ));

        assert!(harness.db.get_all_settings().unwrap().is_empty());
        assert_eq!(service.runtime_config.dynamic().scheduling.high_weight, 4);
    }

    #[test]
    fn test_unknown_setting_is_rejected() {
        let harness = TestHarness::new();
        let service = harness.service();

        let mut updates = HashMap::new();
        updates.insert("nope".to_string(), serde_json::json!(1));
        assert!(matches!(
            service.update_settings(updates),
            Err(ServiceError::InvalidRequest { .. })
        ));
    }
}
