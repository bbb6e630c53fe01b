//! The standard pipeline for each doctype.
//!
//! Text is the base pipeline. Audio and video convert their source to a
//! transcript and then reuse the text steps after `import`.

use super::definition::PipelineDefinition;
use super::step::StepName;
use super::steps::image::{DetectObjects, IndexObjects, PersistObjects};
use super::steps::media::{ConvertAudio, ImportMedia, Transcribe};
use super::steps::text::{
    AnnotateEntities, CleanMarkup, DetectLanguage, EmbedSentences, ExtractText, ImportText,
    IndexText, PersistText,
};
use crate::db::Doctype;

pub fn text_pipeline() -> PipelineDefinition {
    PipelineDefinition::builder(Doctype::Text)
        .step(ImportText)
        .step(CleanMarkup)
        .step(ExtractText)
        .step(DetectLanguage)
        .step(AnnotateEntities)
        .batched(EmbedSentences)
        .step(PersistText)
        .step(IndexText)
        .build()
}

pub fn image_pipeline() -> PipelineDefinition {
    PipelineDefinition::builder(Doctype::Image)
        .step(ImportMedia)
        .step(DetectObjects)
        .step(PersistObjects)
        .step(IndexObjects)
        .build()
}

pub fn audio_pipeline(text: &PipelineDefinition) -> PipelineDefinition {
    PipelineDefinition::builder(Doctype::Audio)
        .step(ImportMedia)
        .step(ConvertAudio::transcode())
        .step(Transcribe)
        .splice(text, &[StepName::Import])
        .build()
}

pub fn video_pipeline(text: &PipelineDefinition) -> PipelineDefinition {
    PipelineDefinition::builder(Doctype::Video)
        .step(ImportMedia)
        .step(ConvertAudio::extract_audio())
        .step(Transcribe)
        .splice(text, &[StepName::Import])
        .build()
}

/// One definition per doctype; the text steps are shared by audio and video
pub fn standard_pipelines() -> Vec<PipelineDefinition> {
    let text = text_pipeline();
    let audio = audio_pipeline(&text);
    let video = video_pipeline(&text);
    vec![text, image_pipeline(), audio, video]
}

/// Job type that runs the standard pipeline for `doctype`
pub fn pipeline_job_type(doctype: Doctype) -> String {
    format!("{doctype}_pipeline")
}
