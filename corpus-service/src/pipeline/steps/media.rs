//! Steps for binary sources: import, audio extraction and transcription.

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::error::{StepError, StepResult};
use crate::inference::Transcript;
use crate::pipeline::{Cargo, CargoKey, Step, StepContext, StepName};
use crate::storage::compute_content_hash;

/// Verify a binary source is present and readable
pub struct ImportMedia;

impl Step for ImportMedia {
    fn name(&self) -> StepName {
        StepName::Import
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Path]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[CargoKey::ContentHash]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, mut cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let path: String = cargo.get(CargoKey::Path)?;
            let bytes = ctx.storage.read(&path).await?;

            if bytes.is_empty() {
                return Err(StepError::EmptyContent);
            }

            cargo.insert(CargoKey::ContentHash, compute_content_hash(&bytes))?;
            Ok(cargo)
        }
        .boxed()
    }
}

/// Produce PCM audio from an audio or video source.
///
/// Audio pipelines register this as `transcode` and video pipelines as
/// `extract_audio`; the work is the same.
pub struct ConvertAudio {
    name: StepName,
}

impl ConvertAudio {
    pub fn transcode() -> Self {
        Self {
            name: StepName::Transcode,
        }
    }

    pub fn extract_audio() -> Self {
        Self {
            name: StepName::ExtractAudio,
        }
    }
}

impl Step for ConvertAudio {
    fn name(&self) -> StepName {
        self.name
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Path, CargoKey::MimeType]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[CargoKey::AudioPath]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, mut cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let path: String = cargo.get(CargoKey::Path)?;
            let mime_type: String = cargo.get(CargoKey::MimeType)?;

            let media = ctx.storage.read(&path).await?;
            let pcm = ctx.inference.transcode(&media, &mime_type).await?;
            if pcm.is_empty() {
                return Err(StepError::EmptyContent);
            }

            let stored = ctx.storage.store(&pcm, "wav").await?;
            debug!(doc_id = %cargo.subject_id, step = %self.name, path = %stored.path, "Converted audio");

            cargo.insert(CargoKey::AudioPath, stored.path)?;
            Ok(cargo)
        }
        .boxed()
    }
}

/// Speech to text. The transcript feeds the text pipeline as its markup.
pub struct Transcribe;

impl Step for Transcribe {
    fn name(&self) -> StepName {
        StepName::Transcribe
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::AudioPath]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[CargoKey::Html, CargoKey::Transcript]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, mut cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let audio_path: String = cargo.get(CargoKey::AudioPath)?;
            let audio = ctx.storage.read(&audio_path).await?;

            let transcript: Transcript = ctx.inference.transcribe(&audio).await?;
            if transcript.text.trim().is_empty() {
                return Err(StepError::EmptyContent);
            }

            cargo.insert(CargoKey::Html, &transcript.text)?;
            cargo.insert(CargoKey::Transcript, transcript)?;
            Ok(cargo)
        }
        .boxed()
    }
}
