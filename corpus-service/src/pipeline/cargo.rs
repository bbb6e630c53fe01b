//! Per-subject working state carried through a pipeline.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::db::Doctype;
use crate::error::{StepError, StepResult};

/// Named slots in a cargo. Steps declare which they read and write.
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
pub enum CargoKey {
    /// Object store path of the source file
    Path,
    Filename,
    MimeType,
    ContentHash,
    /// Markup or raw text awaiting cleanup
    Html,
    /// Plain text after markup removal
    Text,
    Sentences,
    Language,
    Annotations,
    EmbeddingCount,
    Objects,
    /// Object store path of transcoded PCM audio
    AudioPath,
    Transcript,
}

/// Working state for one subject (document) of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cargo {
    pub subject_id: String,
    pub project_id: String,
    pub doctype: Doctype,
    /// Index of the step currently (or last) applied
    pub step_index: usize,
    data: serde_json::Map<String, serde_json::Value>,
}

impl Cargo {
    pub fn new(
        subject_id: impl Into<String>,
        project_id: impl Into<String>,
        doctype: Doctype,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            project_id: project_id.into(),
            doctype,
            step_index: 0,
            data: serde_json::Map::new(),
        }
    }

    /// Typed read; fails with `MissingCargoKey` if nothing was written
    pub fn get<T: DeserializeOwned>(&self, key: CargoKey) -> StepResult<T> {
        let value = self
            .data
            .get(key.as_ref())
            .ok_or(StepError::MissingCargoKey { key })?;

        serde_json::from_value(value.clone())
            .map_err(|source| StepError::InvalidCargoValue { key, source })
    }

    pub fn get_opt<T: DeserializeOwned>(&self, key: CargoKey) -> StepResult<Option<T>> {
        if self.contains(key) {
            self.get(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Write a slot, replacing any previous value
    pub fn insert<T: Serialize>(&mut self, key: CargoKey, value: T) -> StepResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|source| StepError::InvalidCargoValue { key, source })?;
        self.data.insert(key.as_ref().to_string(), value);
        Ok(())
    }

    /// Builder form of [`Cargo::insert`]
    pub fn with<T: Serialize>(mut self, key: CargoKey, value: T) -> StepResult<Self> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn contains(&self, key: CargoKey) -> bool {
        self.data.contains_key(key.as_ref())
    }

    /// First key of `keys` that has not been written
    pub fn first_missing(&self, keys: &[CargoKey]) -> Option<CargoKey> {
        keys.iter().copied().find(|key| !self.contains(*key))
    }

    /// Cargo data as stored in snapshots
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Object(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_an_error() {
        let cargo = Cargo::new("d1", "p1", Doctype::Text);
        let err = cargo.get::<String>(CargoKey::Html).unwrap_err();
        assert!(matches!(
            err,
            StepError::MissingCargoKey {
                key: CargoKey::Html
            }
        ));
        assert_eq!(cargo.get_opt::<String>(CargoKey::Html).unwrap(), None);
    }

    #[test]
    fn test_wrong_type_is_invalid_value() {
        let cargo = Cargo::new("d1", "p1", Doctype::Text)
            .with(CargoKey::Language, 42)
            .unwrap();
        assert!(matches!(
            cargo.get::<Vec<String>>(CargoKey::Language),
            Err(StepError::InvalidCargoValue { .. })
        ));
    }

    #[test]
    fn test_first_missing_and_snapshot() {
        let cargo = Cargo::new("d1", "p1", Doctype::Text)
            .with(CargoKey::Path, "files/ab/x.txt")
            .unwrap();

        assert_eq!(
            cargo.first_missing(&[CargoKey::Path, CargoKey::MimeType]),
            Some(CargoKey::MimeType)
        );
        assert_eq!(cargo.snapshot()["path"], "files/ab/x.txt");
        assert_eq!(cargo.get::<String>(CargoKey::Path).unwrap(), "files/ab/x.txt");
    }
}
