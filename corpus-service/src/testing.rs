//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tempfile::TempDir;

use crate::config::{DynamicConfig, RuntimeConfig, StaticConfig};
use crate::db::{ConcurrencyClass, Database, Doctype, Document, JobPriority, JobRecord, JobStatus};
use crate::error::{InferenceError, ServiceResult};
use crate::events::EventBus;
use crate::i18n::I18n;
use crate::inference::{DetectedObject, EntitySpan, Inference, LanguageDetection, Transcript};
use crate::jobs::JobResources;
use crate::pipeline::{StepContext, StepName};
use crate::service::CorpusService;
use crate::storage::FileStore;

pub(crate) fn sample_document(id: &str, doctype: Doctype) -> Document {
    let now = Utc::now();
    Document {
        id: id.to_string(),
        project_id: "p1".to_string(),
        doctype,
        title: id.to_string(),
        filename: format!("{id}.txt"),
        file_path: "files/ab/abc.txt".to_string(),
        content_hash: "abc".to_string(),
        mime_type: "text/plain".to_string(),
        language: None,
        text: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn queued_job(id: &str, priority: JobPriority) -> JobRecord {
    let now = Utc::now();
    JobRecord {
        id: id.to_string(),
        job_type: "text_pipeline".to_string(),
        status: JobStatus::Queued,
        priority,
        concurrency_class: ConcurrencyClass::Cpu,
        project_id: "p1".to_string(),
        input: serde_json::json!({"project_id": "p1"}),
        output: None,
        error: None,
        current_step: 0,
        steps: vec!["import".to_string()],
        retry_count: 0,
        max_retries: 2,
        next_run_at: now,
        created_at: now,
        updated_at: now,
        started_at: None,
        finished_at: None,
    }
}

/// Temporary database and object store plus a scripted inference service
pub(crate) struct TestHarness {
    dir: TempDir,
    pub db: Arc<Database>,
    pub storage: Arc<FileStore>,
    pub inference: Arc<FakeInference>,
    pub config: Arc<DynamicConfig>,
    pub events: EventBus,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(DynamicConfig::default())
    }

    pub fn with_batch_size(size: usize) -> Self {
        let mut config = DynamicConfig::default();
        config.batching.embedding_batch_size = size;
        Self::with_config(config)
    }

    pub fn with_config(config: DynamicConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("corpus.db")).unwrap();
        let storage = FileStore::new(dir.path());

        Self {
            dir,
            db: Arc::new(db),
            storage: Arc::new(storage),
            inference: Arc::new(FakeInference::default()),
            config: Arc::new(config),
            events: EventBus::default(),
        }
    }

    pub fn insert_document(&self, id: &str, doctype: Doctype, steps: &[StepName]) {
        self.db
            .insert_document(&sample_document(id, doctype), steps)
            .unwrap();
    }

    /// Step context for a running job, creating the job row if needed
    pub fn step_context(&self, job_id: &str, steps: &[StepName]) -> StepContext {
        if self.db.get_job(job_id).unwrap().is_none() {
            let job = JobRecord {
                status: JobStatus::Running,
                steps: steps.iter().map(ToString::to_string).collect(),
                ..queued_job(job_id, JobPriority::Default)
            };
            self.db.insert_job(&job).unwrap();
        }

        StepContext {
            job_id: job_id.to_string(),
            db: self.db.clone(),
            storage: self.storage.clone(),
            inference: self.inference.clone(),
            config: self.config.clone(),
            cancel: Default::default(),
            events: self.events.clone(),
        }
    }

    /// Runtime config whose data dir is the harness directory
    pub fn runtime_config(&self) -> Arc<RuntimeConfig> {
        let mut static_config = StaticConfig::default();
        static_config.storage.data_dir = self.dir.path().to_path_buf();
        Arc::new(RuntimeConfig::new(static_config, (*self.config).clone()))
    }

    pub fn resources(&self) -> JobResources {
        JobResources {
            db: self.db.clone(),
            storage: self.storage.clone(),
            inference: self.inference.clone(),
            config: self.runtime_config(),
            events: self.events.clone(),
            i18n: Arc::new(I18n::new()),
        }
    }

    /// A full service over the harness database and object store
    pub fn service(&self) -> Arc<CorpusService> {
        Arc::new(
            CorpusService::new(self.db.clone(), self.runtime_config(), self.inference.clone())
                .unwrap(),
        )
    }
}

#[derive(Default)]
struct FakeState {
    language: Option<String>,
    embed_calls: Vec<usize>,
    fail_embed_call: Option<usize>,
}

/// In-process stand-in for the inference service.
///
/// Tags every capitalized word as `PROPER_NOUN`, finds a cat and a dog in
/// every image and always hears the same sentence.
#[derive(Default)]
pub(crate) struct FakeInference {
    state: Mutex<FakeState>,
}

const TRANSCRIPT: &str = "Welcome to the archive. Today Ada reads aloud.";

impl FakeInference {
    pub fn set_language(&self, language: &str) {
        self.state.lock().unwrap().language = Some(language.to_string());
    }

    /// Sizes of every embed request so far
    pub fn embed_calls(&self) -> Vec<usize> {
        self.state.lock().unwrap().embed_calls.clone()
    }

    /// Make the `index`-th embed request (zero-based) fail with a 503
    pub fn fail_embed_call(&self, index: usize) {
        self.state.lock().unwrap().fail_embed_call = Some(index);
    }

    pub fn transcript_text(&self) -> &'static str {
        TRANSCRIPT
    }
}

fn capitalized_words(sentence_index: usize, sentence: &str) -> Vec<EntitySpan> {
    let chars: Vec<char> = sentence.chars().collect();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_alphabetic() {
            let begin = i;
            while i < chars.len() && chars[i].is_alphabetic() {
                i += 1;
            }
            if chars[begin].is_uppercase() {
                spans.push(EntitySpan {
                    sentence_index,
                    begin,
                    end: i,
                    label: "PROPER_NOUN".to_string(),
                    confidence: Some(0.9),
                });
            }
        } else {
            i += 1;
        }
    }
    spans
}

impl Inference for FakeInference {
    fn detect_language<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, ServiceResult<LanguageDetection>> {
        let language = self
            .state
            .lock()
            .unwrap()
            .language
            .clone()
            .unwrap_or_else(|| "en".to_string());
        futures::future::ready(Ok(LanguageDetection {
            language,
            confidence: 0.99,
        }))
        .boxed()
    }

    fn annotate<'a>(
        &'a self,
        _language: &'a str,
        sentences: &'a [String],
    ) -> BoxFuture<'a, ServiceResult<Vec<EntitySpan>>> {
        let spans = sentences
            .iter()
            .enumerate()
            .flat_map(|(index, sentence)| capitalized_words(index, sentence))
            .collect();
        futures::future::ready(Ok(spans)).boxed()
    }

    fn embed<'a>(&'a self, inputs: &'a [String]) -> BoxFuture<'a, ServiceResult<Vec<Vec<f32>>>> {
        let mut state = self.state.lock().unwrap();
        let call = state.embed_calls.len();
        state.embed_calls.push(inputs.len());

        let result = if state.fail_embed_call == Some(call) {
            Err(InferenceError::Status {
                status: 503,
                message: "overloaded".to_string(),
            }
            .into())
        } else {
            Ok(inputs
                .iter()
                .map(|input| vec![input.chars().count() as f32, 1.0])
                .collect())
        };
        futures::future::ready(result).boxed()
    }

    fn detect_objects<'a>(&'a self, _image: &'a [u8]) -> BoxFuture<'a, ServiceResult<Vec<DetectedObject>>> {
        let object = |label: &str, x: f32| DetectedObject {
            label: label.to_string(),
            confidence: 0.8,
            x,
            y: 0.0,
            width: 10.0,
            height: 10.0,
        };
        futures::future::ready(Ok(vec![object("dog", 0.0), object("cat", 20.0)])).boxed()
    }

    fn transcode<'a>(&'a self, _media: &'a [u8], _mime_type: &'a str) -> BoxFuture<'a, ServiceResult<Vec<u8>>> {
        futures::future::ready(Ok(b"RIFF fake pcm".to_vec())).boxed()
    }

    fn transcribe<'a>(&'a self, _audio: &'a [u8]) -> BoxFuture<'a, ServiceResult<Transcript>> {
        futures::future::ready(Ok(Transcript {
            text: TRANSCRIPT.to_string(),
            language: Some("en".to_string()),
        }))
        .boxed()
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        futures::future::ready(true).boxed()
    }
}
