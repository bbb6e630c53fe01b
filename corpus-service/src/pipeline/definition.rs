//! Ordered step lists per doctype, with static requirement checking.

use std::collections::HashSet;
use std::sync::Arc;

use super::cargo::CargoKey;
use super::step::{BatchStep, PipelineStep, Step, StepName};
use crate::db::Doctype;
use crate::error::PipelineError;

/// Immutable ordered list of steps for one doctype
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    doctype: Doctype,
    steps: Vec<PipelineStep>,
}

impl PipelineDefinition {
    pub fn builder(doctype: Doctype) -> PipelineBuilder {
        PipelineBuilder {
            doctype,
            steps: Vec::new(),
        }
    }

    pub fn doctype(&self) -> Doctype {
        self.doctype
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<StepName> {
        self.steps.iter().map(PipelineStep::name).collect()
    }

    /// Check that every step's inputs exist by the time it runs.
    ///
    /// `provided` are the keys the job input seeds every cargo with.
    pub fn validate(&self, provided: &[CargoKey]) -> Result<(), PipelineError> {
        if self.steps.is_empty() {
            return Err(PipelineError::Empty {
                doctype: self.doctype,
            });
        }

        let mut seen = HashSet::new();
        let mut available: HashSet<CargoKey> = provided.iter().copied().collect();

        for (position, step) in self.steps.iter().enumerate() {
            let name = step.name();
            if !seen.insert(name) {
                return Err(PipelineError::DuplicateStep { step: name });
            }

            if let Some(key) = step
                .requires()
                .iter()
                .find(|key| !available.contains(*key))
            {
                return Err(PipelineError::UnsatisfiedRequirement {
                    step: name,
                    key: *key,
                    position,
                });
            }

            available.extend(step.produces().iter().copied());
        }

        Ok(())
    }
}

pub struct PipelineBuilder {
    doctype: Doctype,
    steps: Vec<PipelineStep>,
}

impl PipelineBuilder {
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(PipelineStep::Single(Arc::new(step)));
        self
    }

    pub fn batched(mut self, step: impl BatchStep + 'static) -> Self {
        self.steps.push(PipelineStep::Batched(Arc::new(step)));
        self
    }

    /// Append another definition's steps (shared, not copied), leaving out `skip`
    pub fn splice(mut self, other: &PipelineDefinition, skip: &[StepName]) -> Self {
        self.steps.extend(
            other
                .steps
                .iter()
                .filter(|step| !skip.contains(&step.name()))
                .cloned(),
        );
        self
    }

    pub fn build(self) -> PipelineDefinition {
        PipelineDefinition {
            doctype: self.doctype,
            steps: self.steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepResult;
    use crate::pipeline::{Cargo, StepContext};
    use futures::FutureExt;
    use futures::future::BoxFuture;

    struct Fixed {
        name: StepName,
        requires: &'static [CargoKey],
        produces: &'static [CargoKey],
    }

    impl Step for Fixed {
        fn name(&self) -> StepName {
            self.name
        }

        fn requires(&self) -> &'static [CargoKey] {
            self.requires
        }

        fn produces(&self) -> &'static [CargoKey] {
            self.produces
        }

        fn run<'a>(
            &'a self,
            _ctx: &'a StepContext,
            cargo: Cargo,
        ) -> BoxFuture<'a, StepResult<Cargo>> {
            async move { Ok(cargo) }.boxed()
        }
    }

    fn fixed(
        name: StepName,
        requires: &'static [CargoKey],
        produces: &'static [CargoKey],
    ) -> Fixed {
        Fixed {
            name,
            requires,
            produces,
        }
    }

    #[test]
    fn test_requirement_before_producer_is_rejected() {
        let definition = PipelineDefinition::builder(Doctype::Text)
            .step(fixed(StepName::Import, &[CargoKey::Path], &[]))
            .step(fixed(StepName::Clean, &[CargoKey::Html], &[CargoKey::Html]))
            .step(fixed(StepName::ExtractText, &[], &[CargoKey::Html]))
            .build();

        assert_eq!(
            definition.validate(&[CargoKey::Path]),
            Err(PipelineError::UnsatisfiedRequirement {
                step: StepName::Clean,
                key: CargoKey::Html,
                position: 1,
            })
        );
    }

    #[test]
    fn test_job_input_keys_satisfy_requirements() {
        let definition = PipelineDefinition::builder(Doctype::Text)
            .step(fixed(StepName::Import, &[CargoKey::Path], &[CargoKey::Html]))
            .step(fixed(StepName::Clean, &[CargoKey::Html], &[CargoKey::Html]))
            .build();

        assert_eq!(definition.validate(&[CargoKey::Path]), Ok(()));
        assert!(definition.validate(&[]).is_err());
    }

    #[test]
    fn test_duplicate_and_empty() {
        let duplicate = PipelineDefinition::builder(Doctype::Image)
            .step(fixed(StepName::Import, &[], &[]))
            .step(fixed(StepName::Import, &[], &[]))
            .build();
        assert_eq!(
            duplicate.validate(&[]),
            Err(PipelineError::DuplicateStep {
                step: StepName::Import
            })
        );

        let empty = PipelineDefinition::builder(Doctype::Audio).build();
        assert_eq!(
            empty.validate(&[]),
            Err(PipelineError::Empty {
                doctype: Doctype::Audio
            })
        );
    }

    #[test]
    fn test_splice_shares_steps_and_skips() {
        let base = PipelineDefinition::builder(Doctype::Text)
            .step(fixed(StepName::Import, &[], &[]))
            .step(fixed(StepName::Clean, &[], &[]))
            .build();

        let spliced = PipelineDefinition::builder(Doctype::Audio)
            .step(fixed(StepName::Import, &[], &[]))
            .step(fixed(StepName::Transcribe, &[], &[]))
            .splice(&base, &[StepName::Import])
            .build();

        assert_eq!(
            spliced.step_names(),
            vec![StepName::Import, StepName::Transcribe, StepName::Clean]
        );
        match (&base.steps()[1], &spliced.steps()[2]) {
            (PipelineStep::Single(a), PipelineStep::Single(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected single steps"),
        }
    }
}
