//! Text pipeline steps.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::{AttachedObject, IndexEntry, NewAnnotation};
use crate::error::{ServiceError, StepError, StepResult};
use crate::pipeline::batch::Batcher;
use crate::pipeline::{
    BatchStep, Cargo, CargoKey, Step, StepContext, StepName, SubjectFailure, SubjectResult,
};

/// Longest prefix sent for language identification, in characters
const LANGUAGE_SAMPLE_CHARS: usize = 4096;

/// A sentence of the extracted text. Offsets are character offsets into the
/// document text, end exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    pub text: String,
    pub begin: usize,
    pub end: usize,
}

// ==================== Text helpers ====================

/// Remove script/style blocks and comments, which never carry document text
pub fn strip_non_content(html: &str) -> String {
    let mut out = html.to_string();
    for (open, close) in [
        ("<script", "</script>"),
        ("<style", "</style>"),
        ("<!--", "-->"),
    ] {
        out = remove_blocks(&out, open, close);
    }
    out
}

fn remove_blocks(input: &str, open: &str, close: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with `input`
    let lower = input.to_ascii_lowercase();
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;

    while let Some(start) = lower[cursor..].find(open) {
        let start = cursor + start;
        out.push_str(&input[cursor..start]);
        match lower[start..].find(close) {
            Some(end) => cursor = start + end + close.len(),
            None => {
                cursor = input.len();
                break;
            }
        }
    }
    out.push_str(&input[cursor..]);
    out
}

const BLOCK_TAGS: &[&str] = &[
    "p", "br", "div", "li", "ul", "ol", "tr", "td", "th", "h1", "h2", "h3", "h4", "h5", "h6",
    "section", "article", "header", "footer", "blockquote", "pre", "title",
];

/// Drop markup, decode common entities and collapse whitespace
pub fn markup_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut chars = html.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '<' {
            text.push(c);
            continue;
        }

        let Some(close) = html[i..].find('>') else {
            // Stray '<' in plain text
            text.push(c);
            continue;
        };
        let tag = &html[i + 1..i + close];
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        if name.is_empty() {
            text.push(c);
            continue;
        }
        if BLOCK_TAGS.contains(&name.as_str()) {
            text.push(' ');
        }
        while let Some((j, _)) = chars.peek() {
            if *j > i + close {
                break;
            }
            chars.next();
        }
    }

    let decoded = decode_entities(&text);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Split on terminal punctuation followed by whitespace or end of text
pub fn split_sentences(text: &str) -> Vec<Sentence> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0;

    let push = |from: usize, to: usize, sentences: &mut Vec<Sentence>| {
        let mut begin = from;
        let mut end = to;
        while begin < end && chars[begin].is_whitespace() {
            begin += 1;
        }
        while end > begin && chars[end - 1].is_whitespace() {
            end -= 1;
        }
        if begin < end {
            sentences.push(Sentence {
                text: chars[begin..end].iter().collect(),
                begin,
                end,
            });
        }
    };

    for i in 0..chars.len() {
        let terminal = matches!(chars[i], '.' | '!' | '?');
        let boundary = chars.get(i + 1).is_none_or(|next| next.is_whitespace());
        if terminal && boundary {
            push(start, i + 1, &mut sentences);
            start = i + 1;
        }
    }
    push(start, chars.len(), &mut sentences);

    sentences
}

// ==================== Steps ====================

/// Load the source file as text
pub struct ImportText;

impl Step for ImportText {
    fn name(&self) -> StepName {
        StepName::Import
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Path]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[CargoKey::Html]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, mut cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let path: String = cargo.get(CargoKey::Path)?;
            let bytes = ctx.storage.read(&path).await?;
            let content = String::from_utf8_lossy(&bytes);

            if content.trim().is_empty() {
                return Err(StepError::EmptyContent);
            }

            cargo.insert(CargoKey::Html, content.into_owned())?;
            Ok(cargo)
        }
        .boxed()
    }
}

/// Remove non-content markup
pub struct CleanMarkup;

impl Step for CleanMarkup {
    fn name(&self) -> StepName {
        StepName::Clean
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Html]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[CargoKey::Html]
    }

    fn run<'a>(&'a self, _ctx: &'a StepContext, mut cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let html: String = cargo.get(CargoKey::Html)?;
            cargo.insert(CargoKey::Html, strip_non_content(&html))?;
            Ok(cargo)
        }
        .boxed()
    }
}

/// Plain text and sentence boundaries
pub struct ExtractText;

impl Step for ExtractText {
    fn name(&self) -> StepName {
        StepName::ExtractText
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Html]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[CargoKey::Text, CargoKey::Sentences]
    }

    fn run<'a>(&'a self, _ctx: &'a StepContext, mut cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let html: String = cargo.get(CargoKey::Html)?;
            let text = markup_to_text(&html);
            let sentences = split_sentences(&text);

            if sentences.is_empty() {
                return Err(StepError::EmptyContent);
            }

            debug!(doc_id = %cargo.subject_id, sentences = sentences.len(), "Extracted text");
            cargo.insert(CargoKey::Text, text)?;
            cargo.insert(CargoKey::Sentences, sentences)?;
            Ok(cargo)
        }
        .boxed()
    }
}

/// Identify the document language and reject unsupported ones
pub struct DetectLanguage;

impl Step for DetectLanguage {
    fn name(&self) -> StepName {
        StepName::LanguageDetect
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Text]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[CargoKey::Language]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, mut cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let text: String = cargo.get(CargoKey::Text)?;
            let sample: String = text.chars().take(LANGUAGE_SAMPLE_CHARS).collect();

            let detection = ctx.inference.detect_language(&sample).await?;
            let language = detection.language.to_lowercase();

            if !ctx.config.languages.is_supported(&language) {
                return Err(StepError::UnsupportedLanguage { language });
            }

            debug!(
                doc_id = %cargo.subject_id,
                language = %language,
                confidence = detection.confidence,
                "Detected language"
            );
            cargo.insert(CargoKey::Language, language)?;
            Ok(cargo)
        }
        .boxed()
    }
}

/// Named-entity annotation over sentences
pub struct AnnotateEntities;

impl Step for AnnotateEntities {
    fn name(&self) -> StepName {
        StepName::Annotate
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Sentences, CargoKey::Language]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[CargoKey::Annotations]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, mut cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let sentences: Vec<Sentence> = cargo.get(CargoKey::Sentences)?;
            let language: String = cargo.get(CargoKey::Language)?;
            let texts: Vec<String> = sentences.iter().map(|s| s.text.clone()).collect();

            let spans = ctx.inference.annotate(&language, &texts).await?;

            let mut annotations = Vec::with_capacity(spans.len());
            for span in spans {
                let Some(sentence) = sentences.get(span.sentence_index) else {
                    warn!(doc_id = %cargo.subject_id, index = span.sentence_index, "Entity outside sentence range");
                    continue;
                };
                let length = sentence.end - sentence.begin;
                if span.begin >= span.end || span.end > length {
                    warn!(doc_id = %cargo.subject_id, label = %span.label, "Entity span out of bounds");
                    continue;
                }
                annotations.push(NewAnnotation {
                    code_name: span.label,
                    target: AttachedObject::TextSpan {
                        begin: sentence.begin + span.begin,
                        end: sentence.begin + span.end,
                    },
                    confidence: span.confidence,
                });
            }

            cargo.insert(CargoKey::Annotations, annotations)?;
            Ok(cargo)
        }
        .boxed()
    }
}

/// Sentence embeddings, batched across every subject of the job
pub struct EmbedSentences;

struct EmbedSubject {
    cargo: Cargo,
    sentences: Vec<String>,
    vectors: Vec<Option<Vec<f32>>>,
    error: Option<StepError>,
}

impl BatchStep for EmbedSentences {
    fn name(&self) -> StepName {
        StepName::Embed
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Sentences]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[CargoKey::EmbeddingCount]
    }

    fn run_batch<'a>(
        &'a self,
        ctx: &'a StepContext,
        cargos: Vec<Cargo>,
    ) -> BoxFuture<'a, Vec<SubjectResult>> {
        async move {
            let mut results = Vec::with_capacity(cargos.len());
            let mut subjects = Vec::with_capacity(cargos.len());

            for cargo in cargos {
                match cargo.get::<Vec<Sentence>>(CargoKey::Sentences) {
                    Ok(sentences) => subjects.push(EmbedSubject {
                        vectors: vec![None; sentences.len()],
                        sentences: sentences.into_iter().map(|s| s.text).collect(),
                        cargo,
                        error: None,
                    }),
                    Err(error) => results.push(Err(SubjectFailure {
                        subject_id: cargo.subject_id,
                        step: StepName::Embed,
                        error,
                    })),
                }
            }

            // (subject, sentence) pairs in document order
            let items: Vec<(usize, usize)> = subjects
                .iter()
                .enumerate()
                .flat_map(|(s, subject)| (0..subject.sentences.len()).map(move |i| (s, i)))
                .collect();

            let mut stream = futures::stream::iter(items);
            let mut batcher = Batcher::new(ctx.config.batching.embedding_batch_size);
            while let Some(item) = stream.next().await {
                if let Some(batch) = batcher.push(item) {
                    flush(ctx, &mut subjects, batch).await;
                }
            }
            if let Some(batch) = batcher.finish() {
                flush(ctx, &mut subjects, batch).await;
            }

            for subject in subjects {
                results.push(finish_subject(ctx, subject));
            }
            results
        }
        .boxed()
    }
}

async fn flush(ctx: &StepContext, subjects: &mut [EmbedSubject], batch: Vec<(usize, usize)>) {
    let batch: Vec<(usize, usize)> = batch
        .into_iter()
        .filter(|(s, _)| subjects[*s].error.is_none())
        .collect();
    if batch.is_empty() {
        return;
    }

    if ctx.cancel.is_cancelled() {
        for (s, _) in batch {
            subjects[s].error.get_or_insert(StepError::Cancelled);
        }
        return;
    }

    let inputs: Vec<String> = batch
        .iter()
        .map(|(s, i)| subjects[*s].sentences[*i].clone())
        .collect();

    match ctx.inference.embed(&inputs).await {
        Ok(vectors) if vectors.len() == batch.len() => {
            for ((s, i), vector) in batch.into_iter().zip(vectors) {
                subjects[s].vectors[i] = Some(vector);
            }
        }
        Ok(vectors) => {
            let error = ServiceError::Internal {
                message: format!("expected {} embeddings, got {}", batch.len(), vectors.len()),
            };
            fail_batch(subjects, &batch, &error);
        }
        Err(error) => {
            warn!(job_id = %ctx.job_id, items = batch.len(), error = %error, "Embedding batch failed");
            fail_batch(subjects, &batch, &error);
        }
    }
}

fn fail_batch(subjects: &mut [EmbedSubject], batch: &[(usize, usize)], error: &ServiceError) {
    for (s, _) in batch {
        subjects[*s]
            .error
            .get_or_insert_with(|| StepError::batch_failed(error));
    }
}

fn finish_subject(ctx: &StepContext, subject: EmbedSubject) -> SubjectResult {
    let EmbedSubject {
        mut cargo,
        sentences,
        vectors,
        error,
    } = subject;

    let fail = |subject_id: String, error: StepError| SubjectFailure {
        subject_id,
        step: StepName::Embed,
        error,
    };

    if let Some(error) = error {
        return Err(fail(cargo.subject_id, error));
    }

    let pairs: Vec<(String, Vec<f32>)> = sentences
        .into_iter()
        .zip(vectors)
        .filter_map(|(sentence, vector)| vector.map(|v| (sentence, v)))
        .collect();

    let stored = ctx
        .db
        .replace_sentence_embeddings(&cargo.subject_id, &pairs)
        .map_err(StepError::from)
        .and_then(|_| cargo.insert(CargoKey::EmbeddingCount, pairs.len()));

    match stored {
        Ok(()) => Ok(cargo),
        Err(error) => Err(fail(cargo.subject_id, error)),
    }
}

/// Write text, language and entity annotations
pub struct PersistText;

impl Step for PersistText {
    fn name(&self) -> StepName {
        StepName::Persist
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Text, CargoKey::Language, CargoKey::Annotations]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let text: String = cargo.get(CargoKey::Text)?;
            let language: String = cargo.get(CargoKey::Language)?;
            let annotations: Vec<NewAnnotation> = cargo.get(CargoKey::Annotations)?;

            ctx.db
                .update_document_content(&cargo.subject_id, &text, Some(&language))?;
            let stored = ctx.db.replace_annotations(
                &cargo.subject_id,
                &cargo.project_id,
                "text_span",
                &annotations,
            )?;

            debug!(doc_id = %cargo.subject_id, annotations = stored, "Persisted text annotations");
            Ok(cargo)
        }
        .boxed()
    }
}

/// Make the text searchable
pub struct IndexText;

impl Step for IndexText {
    fn name(&self) -> StepName {
        StepName::Index
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Text, CargoKey::Language]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let entry = IndexEntry {
                document_id: cargo.subject_id.clone(),
                project_id: cargo.project_id.clone(),
                doctype: cargo.doctype,
                language: Some(cargo.get(CargoKey::Language)?),
                content: cargo.get(CargoKey::Text)?,
            };
            ctx.db.upsert_index_entry(&entry)?;
            Ok(cargo)
        }
        .boxed()
    }
}
