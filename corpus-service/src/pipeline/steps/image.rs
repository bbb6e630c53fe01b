//! Image pipeline steps.

use std::collections::BTreeSet;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::db::{AttachedObject, IndexEntry, NewAnnotation};
use crate::error::StepResult;
use crate::inference::DetectedObject;
use crate::pipeline::{Cargo, CargoKey, Step, StepContext, StepName};

pub struct DetectObjects;

impl Step for DetectObjects {
    fn name(&self) -> StepName {
        StepName::ObjectDetect
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Path]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[CargoKey::Objects]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, mut cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let path: String = cargo.get(CargoKey::Path)?;
            let image = ctx.storage.read(&path).await?;
            let objects = ctx.inference.detect_objects(&image).await?;

            cargo.insert(CargoKey::Objects, objects)?;
            Ok(cargo)
        }
        .boxed()
    }
}

/// Store detected objects as bounding-box annotations
pub struct PersistObjects;

impl Step for PersistObjects {
    fn name(&self) -> StepName {
        StepName::Persist
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Objects]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let objects: Vec<DetectedObject> = cargo.get(CargoKey::Objects)?;
            let annotations: Vec<NewAnnotation> = objects
                .into_iter()
                .map(|object| NewAnnotation {
                    code_name: object.label,
                    target: AttachedObject::BoundingBox {
                        x: object.x,
                        y: object.y,
                        width: object.width,
                        height: object.height,
                    },
                    confidence: Some(object.confidence),
                })
                .collect();

            ctx.db.replace_annotations(
                &cargo.subject_id,
                &cargo.project_id,
                "bounding_box",
                &annotations,
            )?;
            Ok(cargo)
        }
        .boxed()
    }
}

/// Index an image by the labels found in it
pub struct IndexObjects;

impl Step for IndexObjects {
    fn name(&self) -> StepName {
        StepName::Index
    }

    fn requires(&self) -> &'static [CargoKey] {
        &[CargoKey::Objects]
    }

    fn produces(&self) -> &'static [CargoKey] {
        &[]
    }

    fn run<'a>(&'a self, ctx: &'a StepContext, cargo: Cargo) -> BoxFuture<'a, StepResult<Cargo>> {
        async move {
            let objects: Vec<DetectedObject> = cargo.get(CargoKey::Objects)?;
            let labels: BTreeSet<String> = objects.into_iter().map(|o| o.label).collect();

            ctx.db.upsert_index_entry(&IndexEntry {
                document_id: cargo.subject_id.clone(),
                project_id: cargo.project_id.clone(),
                doctype: cargo.doctype,
                language: None,
                content: labels.into_iter().collect::<Vec<_>>().join(" "),
            })?;
            Ok(cargo)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Doctype;
    use crate::testing::TestHarness;

    #[tokio::test]
    async fn test_objects_become_annotations_and_index() {
        let harness = TestHarness::new();
        harness.insert_document("d1", Doctype::Image, &[]);
        let ctx = harness.step_context("j1", &[]);
        let image = harness.storage.store(b"\x89PNG fake", "png").await.unwrap();

        let cargo = Cargo::new("d1", "p1", Doctype::Image)
            .with(CargoKey::Path, &image.path)
            .unwrap();
        let cargo = DetectObjects.run(&ctx, cargo).await.unwrap();
        let cargo = PersistObjects.run(&ctx, cargo).await.unwrap();
        IndexObjects.run(&ctx, cargo).await.unwrap();

        let annotations = harness.db.list_annotations("d1").unwrap();
        assert_eq!(annotations.len(), 2);
        assert!(annotations.iter().all(|a| a.target.kind() == "bounding_box"));

        let entry = harness.db.get_index_entry("d1").unwrap().unwrap();
        assert_eq!(entry.content, "cat dog");
        assert_eq!(entry.language, None);
    }
}
