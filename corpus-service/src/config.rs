use arc_swap::ArcSwap;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{Database, JobPriority};
use crate::error::ServiceResult;

// ==================== Static Configuration (startup-only) ====================

/// Static configuration that cannot be changed at runtime
/// These settings affect server binding, storage layout or worker pools and require restart
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default = "default_workers")]
    pub workers: WorkersConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Holds the SQLite database and the object store (`files/`)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Worker pool sizes, one pool per concurrency class
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_cpu_workers")]
    pub cpu: usize,

    /// GPU-bound jobs share a small pool so the inference service is not oversubscribed
    #[serde(default = "default_gpu_workers")]
    pub gpu: usize,
}

// ==================== Dynamic Configuration (hot-reloadable) ====================

/// Dynamic configuration that can be updated at runtime via API
/// DB values override config file/env defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default = "default_inference")]
    pub inference: InferenceConfig,

    #[serde(default = "default_runner")]
    pub runner: RunnerConfig,

    #[serde(default = "default_scheduling")]
    pub scheduling: SchedulingConfig,

    #[serde(default = "default_batching")]
    pub batching: BatchingConfig,

    #[serde(default = "default_languages")]
    pub languages: LanguagesConfig,

    #[serde(default = "default_limits")]
    pub limits: LimitsConfig,

    #[serde(default = "default_retention")]
    pub retention: RetentionConfig,
}

/// Inference service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_inference_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Job runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Applied to job types registered without their own timeout
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// First retry delay; doubles on each further retry
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// How long an idle worker sleeps before polling the queue again
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl RunnerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Weighted round-robin shares per priority
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_high_weight")]
    pub high_weight: u32,

    #[serde(default = "default_default_weight")]
    pub default_weight: u32,

    #[serde(default = "default_low_weight")]
    pub low_weight: u32,
}

impl SchedulingConfig {
    pub fn weight(&self, priority: JobPriority) -> u32 {
        match priority {
            JobPriority::High => self.high_weight,
            JobPriority::Default => self.default_weight,
            JobPriority::Low => self.low_weight,
        }
    }
}

/// Batched step configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Sentences sent to the embedding service per request
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
}

/// Languages the annotation models can handle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguagesConfig {
    #[serde(default = "default_supported_languages")]
    pub supported: Vec<String>,
}

impl LanguagesConfig {
    pub fn is_supported(&self, language: &str) -> bool {
        self.supported.iter().any(|l| l.eq_ignore_ascii_case(language))
    }
}

/// Size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_document_size")]
    pub max_document_size_bytes: u64,
}

/// Job retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// How long terminal jobs are kept before cleanup, in seconds
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    /// Run cleanup every N seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl RetentionConfig {
    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            storage: default_storage(),
            workers: default_workers(),
        }
    }
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            inference: default_inference(),
            runner: default_runner(),
            scheduling: default_scheduling(),
            batching: default_batching(),
            languages: default_languages(),
            limits: default_limits(),
            retention: default_retention(),
        }
    }
}

// ==================== DynamicConfig Settings Keys ====================

/// All valid setting keys for DynamicConfig
pub const VALID_SETTING_KEYS: &[&str] = &[
    "inference.base_url",
    "inference.request_timeout_secs",
    "runner.job_timeout_secs",
    "runner.backoff_base_ms",
    "runner.backoff_max_ms",
    "runner.poll_interval_ms",
    "scheduling.high_weight",
    "scheduling.default_weight",
    "scheduling.low_weight",
    "batching.embedding_batch_size",
    "languages.supported",
    "limits.max_document_size_bytes",
    "retention.job_ttl_secs",
    "retention.cleanup_interval_secs",
];

/// Largest accepted scheduling weight
pub const MAX_SCHEDULING_WEIGHT: u32 = 1_000;

/// Largest accepted backoff setting (one day)
pub const MAX_BACKOFF_MS: u64 = 86_400_000;

impl DynamicConfig {
    /// Check a value before it is stored as an override. `null` reverts to
    /// the default and is always accepted.
    pub fn validate_setting(key: &str, value: &serde_json::Value) -> Result<(), String> {
        if value.is_null() {
            return Ok(());
        }

        let max = match key {
            "scheduling.high_weight" | "scheduling.default_weight" | "scheduling.low_weight" => {
                u64::from(MAX_SCHEDULING_WEIGHT)
            }
            "runner.backoff_base_ms" | "runner.backoff_max_ms" => MAX_BACKOFF_MS,
            _ => return Ok(()),
        };

        match value.as_u64() {
            Some(v) if v <= max => Ok(()),
            _ => Err(format!("{key} must be an integer between 0 and {max}")),
        }
    }

    /// Get all valid setting keys
    pub fn valid_keys() -> HashSet<&'static str> {
        VALID_SETTING_KEYS.iter().copied().collect()
    }

    /// Convert config to key-value map for API response
    pub fn to_key_value_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();

        map.insert(
            "inference.base_url".to_string(),
            serde_json::Value::String(self.inference.base_url.clone()),
        );
        map.insert(
            "inference.request_timeout_secs".to_string(),
            serde_json::json!(self.inference.request_timeout_secs),
        );

        map.insert(
            "runner.job_timeout_secs".to_string(),
            serde_json::json!(self.runner.job_timeout_secs),
        );
        map.insert(
            "runner.backoff_base_ms".to_string(),
            serde_json::json!(self.runner.backoff_base_ms),
        );
        map.insert(
            "runner.backoff_max_ms".to_string(),
            serde_json::json!(self.runner.backoff_max_ms),
        );
        map.insert(
            "runner.poll_interval_ms".to_string(),
            serde_json::json!(self.runner.poll_interval_ms),
        );

        map.insert(
            "scheduling.high_weight".to_string(),
            serde_json::json!(self.scheduling.high_weight),
        );
        map.insert(
            "scheduling.default_weight".to_string(),
            serde_json::json!(self.scheduling.default_weight),
        );
        map.insert(
            "scheduling.low_weight".to_string(),
            serde_json::json!(self.scheduling.low_weight),
        );

        map.insert(
            "batching.embedding_batch_size".to_string(),
            serde_json::json!(self.batching.embedding_batch_size),
        );
        map.insert(
            "languages.supported".to_string(),
            serde_json::json!(self.languages.supported),
        );
        map.insert(
            "limits.max_document_size_bytes".to_string(),
            serde_json::json!(self.limits.max_document_size_bytes),
        );

        map.insert(
            "retention.job_ttl_secs".to_string(),
            serde_json::json!(self.retention.job_ttl_secs),
        );
        map.insert(
            "retention.cleanup_interval_secs".to_string(),
            serde_json::json!(self.retention.cleanup_interval_secs),
        );

        map
    }

    /// Apply DB settings as overrides to this config
    pub fn merge_from_db(&mut self, db_settings: &HashMap<String, serde_json::Value>) {
        for (key, value) in db_settings {
            self.apply_setting(key, value);
        }
    }

    /// Apply a single setting value
    fn apply_setting(&mut self, key: &str, value: &serde_json::Value) {
        match key {
            "inference.base_url" => {
                if let Some(v) = value.as_str() {
                    self.inference.base_url = v.to_string();
                }
            }
            "inference.request_timeout_secs" => {
                if let Some(v) = value.as_u64() {
                    self.inference.request_timeout_secs = v;
                }
            }

            "runner.job_timeout_secs" => {
                if let Some(v) = value.as_u64() {
                    self.runner.job_timeout_secs = v;
                }
            }
            "runner.backoff_base_ms" => {
                if let Some(v) = value.as_u64() {
                    self.runner.backoff_base_ms = v.min(MAX_BACKOFF_MS);
                }
            }
            "runner.backoff_max_ms" => {
                if let Some(v) = value.as_u64() {
                    self.runner.backoff_max_ms = v.min(MAX_BACKOFF_MS);
                }
            }
            "runner.poll_interval_ms" => {
                if let Some(v) = value.as_u64() {
                    self.runner.poll_interval_ms = v;
                }
            }

            "scheduling.high_weight" => {
                if let Some(v) = value.as_u64() {
                    self.scheduling.high_weight = clamp_weight(v);
                }
            }
            "scheduling.default_weight" => {
                if let Some(v) = value.as_u64() {
                    self.scheduling.default_weight = clamp_weight(v);
                }
            }
            "scheduling.low_weight" => {
                if let Some(v) = value.as_u64() {
                    self.scheduling.low_weight = clamp_weight(v);
                }
            }

            "batching.embedding_batch_size" => {
                if let Some(v) = value.as_u64() {
                    self.batching.embedding_batch_size = (v as usize).max(1);
                }
            }

            "languages.supported" => {
                if let Some(values) = value.as_array() {
                    self.languages.supported = values
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.to_string())
                        .collect();
                }
            }

            "limits.max_document_size_bytes" => {
                if let Some(v) = value.as_u64() {
                    self.limits.max_document_size_bytes = v;
                }
            }

            "retention.job_ttl_secs" => {
                if let Some(v) = value.as_u64() {
                    self.retention.job_ttl_secs = v;
                }
            }
            "retention.cleanup_interval_secs" => {
                if let Some(v) = value.as_u64() {
                    self.retention.cleanup_interval_secs = v;
                }
            }

            _ => {
                tracing::warn!(key = %key, "Unknown setting key in merge_from_db");
            }
        }
    }
}

fn clamp_weight(value: u64) -> u32 {
    u32::try_from(value)
        .unwrap_or(u32::MAX)
        .min(MAX_SCHEDULING_WEIGHT)
}

// ==================== RuntimeConfig (combines static + dynamic) ====================

/// Runtime configuration manager
/// Combines static config (startup-only) with dynamic config (hot-reloadable via ArcSwap)
pub struct RuntimeConfig {
    /// Static configuration (never changes after startup)
    pub static_config: StaticConfig,
    /// Dynamic configuration (can be hot-reloaded)
    dynamic: ArcSwap<DynamicConfig>,
}

impl RuntimeConfig {
    /// Build from already-loaded parts
    pub fn new(static_config: StaticConfig, dynamic: DynamicConfig) -> Self {
        Self {
            static_config,
            dynamic: ArcSwap::from_pointee(dynamic),
        }
    }

    /// Get current dynamic config snapshot (lock-free read)
    pub fn dynamic(&self) -> arc_swap::Guard<Arc<DynamicConfig>> {
        self.dynamic.load()
    }

    /// Owned snapshot for work that outlives a single borrow (a whole job run)
    pub fn snapshot(&self) -> Arc<DynamicConfig> {
        self.dynamic.load_full()
    }

    /// Update dynamic config (atomic swap)
    pub fn update_dynamic(&self, new_config: DynamicConfig) {
        self.dynamic.store(Arc::new(new_config));
    }

    /// Load config from all sources with DB overrides
    pub fn load(static_config: StaticConfig, db: &Database) -> ServiceResult<Self> {
        // Load dynamic config defaults from env/file, then apply DB overrides
        let mut dynamic = load_dynamic_config()?;
        let db_settings = db.get_all_settings()?;
        dynamic.merge_from_db(&db_settings);

        Ok(Self::new(static_config, dynamic))
    }

    /// Rebuild dynamic config from file/env defaults + DB and swap atomically
    pub fn reload_from_db(&self, db: &Database) -> ServiceResult<()> {
        let mut dynamic = load_dynamic_config()?;
        let db_settings = db.get_all_settings()?;
        dynamic.merge_from_db(&db_settings);
        self.update_dynamic(dynamic);
        Ok(())
    }
}

// ==================== Config Loading Functions ====================

fn config_sources() -> ServiceResult<Config> {
    Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("CORPUS")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| crate::error::ServiceError::Config {
            message: format!("Failed to build config: {}", e),
        })
}

/// Load static configuration from file and env vars
pub fn load_static_config() -> ServiceResult<StaticConfig> {
    config_sources()?
        .try_deserialize()
        .map_err(|e| crate::error::ServiceError::Config {
            message: format!("Failed to deserialize static config: {}", e),
        })
}

/// Load dynamic configuration from file and env vars (without DB overrides)
fn load_dynamic_config() -> ServiceResult<DynamicConfig> {
    config_sources()?
        .try_deserialize()
        .map_err(|e| crate::error::ServiceError::Config {
            message: format!("Failed to deserialize dynamic config: {}", e),
        })
}

// ==================== Default Value Functions ====================

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_workers() -> WorkersConfig {
    WorkersConfig {
        cpu: default_cpu_workers(),
        gpu: default_gpu_workers(),
    }
}

fn default_cpu_workers() -> usize {
    4
}

fn default_gpu_workers() -> usize {
    1
}

fn default_inference() -> InferenceConfig {
    InferenceConfig {
        base_url: default_inference_url(),
        request_timeout_secs: default_request_timeout_secs(),
    }
}

fn default_inference_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_runner() -> RunnerConfig {
    RunnerConfig {
        job_timeout_secs: default_job_timeout_secs(),
        backoff_base_ms: default_backoff_base_ms(),
        backoff_max_ms: default_backoff_max_ms(),
        poll_interval_ms: default_poll_interval_ms(),
    }
}

fn default_job_timeout_secs() -> u64 {
    30 * 60
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    5 * 60 * 1000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_scheduling() -> SchedulingConfig {
    SchedulingConfig {
        high_weight: default_high_weight(),
        default_weight: default_default_weight(),
        low_weight: default_low_weight(),
    }
}

fn default_high_weight() -> u32 {
    4
}

fn default_default_weight() -> u32 {
    2
}

fn default_low_weight() -> u32 {
    1
}

fn default_batching() -> BatchingConfig {
    BatchingConfig {
        embedding_batch_size: default_embedding_batch_size(),
    }
}

fn default_embedding_batch_size() -> usize {
    64
}

fn default_languages() -> LanguagesConfig {
    LanguagesConfig {
        supported: default_supported_languages(),
    }
}

fn default_supported_languages() -> Vec<String> {
    ["en", "de", "fr", "es", "it", "nl"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_limits() -> LimitsConfig {
    LimitsConfig {
        max_document_size_bytes: default_max_document_size(),
    }
}

fn default_max_document_size() -> u64 {
    1_073_741_824 // 1GB, video uploads
}

fn default_retention() -> RetentionConfig {
    RetentionConfig {
        job_ttl_secs: default_job_ttl_secs(),
        cleanup_interval_secs: default_cleanup_interval_secs(),
    }
}

fn default_job_ttl_secs() -> u64 {
    30 * 24 * 60 * 60 // 30 days
}

fn default_cleanup_interval_secs() -> u64 {
    60 * 60 // 1 hour
}
