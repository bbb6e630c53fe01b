//! Database model structs.
//!
//! This module contains the data structures for database records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::Row;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Category of a source document; decides which pipeline applies
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Doctype {
    Text,
    Image,
    Audio,
    Video,
}

impl Doctype {
    /// Map an upload's content type to a doctype
    pub fn from_mime(mime: &mime::Mime) -> Option<Self> {
        let top = mime.type_();
        if top == mime::TEXT {
            Some(Doctype::Text)
        } else if top == mime::IMAGE {
            Some(Doctype::Image)
        } else if top == mime::AUDIO {
            Some(Doctype::Audio)
        } else if top == mime::VIDEO {
            Some(Doctype::Video)
        } else if mime.subtype() == mime::XML || mime.subtype() == mime::JSON {
            Some(Doctype::Text)
        } else {
            None
        }
    }

    /// Best-effort content type for a filename extension
    pub fn guess_mime(filename: &str) -> mime::Mime {
        let extension = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        let guessed = match extension.as_str() {
            "txt" | "md" => "text/plain",
            "html" | "htm" => "text/html",
            "xml" => "application/xml",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            "mp3" => "audio/mpeg",
            "wav" => "audio/wav",
            "ogg" => "audio/ogg",
            "mp4" => "video/mp4",
            "webm" => "video/webm",
            _ => "application/octet-stream",
        };
        guessed
            .parse()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM)
    }
}

/// Lifecycle state of a job
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Errored,
    Aborted,
}

impl JobStatus {
    /// The only edges a job may take. `Errored -> Queued` is the retry edge.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Aborted)
                | (Running, Finished)
                | (Running, Errored)
                | (Running, Aborted)
                | (Errored, Queued)
        )
    }
}

/// Dispatch priority among jobs of the same concurrency class
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Default,
    Low,
}

/// Which worker pool runs a job
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConcurrencyClass {
    #[default]
    Cpu,
    Gpu,
}

/// Parse a TEXT column into a strum enum, surfacing bad values as conversion errors
pub(crate) fn parse_column<T>(idx: usize, value: &str) -> Result<T, rusqlite::Error>
where
    T: FromStr<Err = strum::ParseError>,
{
    T::from_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Fixed-width UTC form so stored timestamps compare correctly as text
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json_column(idx: usize, value: &str) -> Result<serde_json::Value, rusqlite::Error> {
    serde_json::from_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub concurrency_class: ConcurrencyClass,
    pub project_id: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Index into `steps` of the step currently executing
    pub current_step: usize,
    pub steps: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest time the job may be dispatched (backoff)
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub(crate) const COLUMNS: &'static str = "id, job_type, status, priority, concurrency_class, project_id, input, output, error, \
         current_step, steps, retry_count, max_retries, next_run_at, created_at, updated_at, started_at, finished_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let status_str: String = row.get(2)?;
        let priority_str: String = row.get(3)?;
        let class_str: String = row.get(4)?;
        let input_str: String = row.get(6)?;
        let output_str: Option<String> = row.get(7)?;
        let current_step: i64 = row.get(9)?;
        let steps_str: String = row.get(10)?;
        let next_run_at_str: String = row.get(13)?;
        let created_at_str: String = row.get(14)?;
        let updated_at_str: String = row.get(15)?;
        let started_at_str: Option<String> = row.get(16)?;
        let finished_at_str: Option<String> = row.get(17)?;

        Ok(Self {
            id: row.get(0)?,
            job_type: row.get(1)?,
            status: parse_column(2, &status_str)?,
            priority: parse_column(3, &priority_str)?,
            concurrency_class: parse_column(4, &class_str)?,
            project_id: row.get(5)?,
            input: parse_json_column(6, &input_str)?,
            output: output_str
                .as_deref()
                .map(|s| parse_json_column(7, s))
                .transpose()?,
            error: row.get(8)?,
            current_step: current_step as usize,
            steps: serde_json::from_str(&steps_str).unwrap_or_default(),
            retry_count: row.get(11)?,
            max_retries: row.get(12)?,
            next_run_at: parse_timestamp(&next_run_at_str),
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
            started_at: started_at_str.as_deref().map(parse_timestamp),
            finished_at: finished_at_str.as_deref().map(parse_timestamp),
        })
    }
}

/// Source document record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub project_id: String,
    pub doctype: Doctype,
    pub title: String,
    pub filename: String,
    /// Path relative to the object store root
    pub file_path: String,
    pub content_hash: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub(crate) const COLUMNS: &'static str = "id, project_id, doctype, title, filename, file_path, content_hash, mime_type, \
         language, text, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let doctype_str: String = row.get(2)?;
        let created_at_str: String = row.get(10)?;
        let updated_at_str: String = row.get(11)?;

        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            doctype: parse_column(2, &doctype_str)?,
            title: row.get(3)?,
            filename: row.get(4)?,
            file_path: row.get(5)?,
            content_hash: row.get(6)?,
            mime_type: row.get(7)?,
            language: row.get(8)?,
            text: row.get(9)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

/// What an annotation is attached to inside its document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttachedObject {
    /// Character range in the document's extracted text
    TextSpan { begin: usize, end: usize },
    /// Pixel region in an image
    BoundingBox {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
}

impl AttachedObject {
    pub fn kind(&self) -> &'static str {
        match self {
            AttachedObject::TextSpan { .. } => "text_span",
            AttachedObject::BoundingBox { .. } => "bounding_box",
        }
    }
}

/// A code applied to part of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: i64,
    pub document_id: String,
    pub code_id: i64,
    pub code_name: String,
    pub target: AttachedObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// A new annotation before the code has been resolved to an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAnnotation {
    pub code_name: String,
    pub target: AttachedObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Searchable text for one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub document_id: String,
    pub project_id: String,
    pub doctype: Doctype,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_edges() {
        use JobStatus::*;
        use strum::IntoEnumIterator;

        let allowed = [
            (Queued, Running),
            (Queued, Aborted),
            (Running, Finished),
            (Running, Errored),
            (Running, Aborted),
            (Errored, Queued),
        ];

        for from in JobStatus::iter() {
            for to in JobStatus::iter() {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_statuses_only_leave_through_retry() {
        use strum::IntoEnumIterator;

        for terminal in [JobStatus::Finished, JobStatus::Errored, JobStatus::Aborted] {
            for next in JobStatus::iter() {
                let allowed = terminal == JobStatus::Errored && next == JobStatus::Queued;
                assert_eq!(terminal.can_transition_to(next), allowed, "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_doctype_from_mime() {
        assert_eq!(
            Doctype::from_mime(&mime::TEXT_HTML),
            Some(Doctype::Text)
        );
        assert_eq!(
            Doctype::from_mime(&Doctype::guess_mime("clip.MP4")),
            Some(Doctype::Video)
        );
        assert_eq!(
            Doctype::from_mime(&Doctype::guess_mime("scan.jpeg")),
            Some(Doctype::Image)
        );
        assert_eq!(Doctype::from_mime(&mime::APPLICATION_OCTET_STREAM), None);
    }

    #[test]
    fn test_attached_object_serialization() {
        let span = AttachedObject::TextSpan { begin: 3, end: 9 };
        let json = serde_json::to_value(&span).unwrap();
        assert_eq!(json["kind"], "text_span");
        assert_eq!(span.kind(), "text_span");
    }
}
