//! Generic interpreter for pipeline definitions.
//!
//! Subjects move through the steps in lockstep: every live subject finishes
//! step N before any starts step N+1. A subject that fails leaves the chain
//! and keeps the flags it already earned; the others carry on.

use tracing::{debug, warn};

use super::cargo::Cargo;
use super::definition::PipelineDefinition;
use super::step::{PipelineStep, StepContext, StepName, SubjectFailure, SubjectResult};
use crate::error::{StepError, StepResult};
use crate::events::ServiceEvent;

/// What happened to each subject of a run
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub succeeded: Vec<Cargo>,
    pub failed: Vec<SubjectFailure>,
}

impl ExecutionReport {
    /// Every subject dropped out
    pub fn all_failed(&self) -> bool {
        self.succeeded.is_empty() && !self.failed.is_empty()
    }
}

/// Run `definition` over `cargos`.
///
/// Returns `Err` only for cancellation or when the job's progress cannot be
/// recorded; per-subject failures end up in the report.
pub async fn execute(
    definition: &PipelineDefinition,
    ctx: &StepContext,
    cargos: Vec<Cargo>,
) -> StepResult<ExecutionReport> {
    let mut live = cargos;
    let mut failed = Vec::new();

    for (index, step) in definition.steps().iter().enumerate() {
        if live.is_empty() {
            break;
        }
        ctx.check_cancelled()?;
        ctx.db.update_job_step(&ctx.job_id, index)?;

        let name = step.name();
        debug!(job_id = %ctx.job_id, step = %name, subjects = live.len(), "Running step");

        let mut ready = Vec::with_capacity(live.len());
        for mut cargo in live {
            match cargo.first_missing(step.requires()) {
                Some(key) => failed.push(SubjectFailure {
                    subject_id: cargo.subject_id,
                    step: name,
                    error: StepError::MissingCargoKey { key },
                }),
                None => {
                    cargo.step_index = index;
                    ready.push(cargo);
                }
            }
        }

        let results = run_step(step, ctx, ready).await?;

        live = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(cargo) => match commit(ctx, name, index, &cargo) {
                    Ok(()) => {
                        metrics::counter!("corpus_steps_total", "step" => name.to_string(), "outcome" => "success")
                            .increment(1);
                        live.push(cargo);
                    }
                    Err(error) => failed.push(SubjectFailure {
                        subject_id: cargo.subject_id,
                        step: name,
                        error,
                    }),
                },
                Err(failure) => {
                    warn!(
                        job_id = %ctx.job_id,
                        doc_id = %failure.subject_id,
                        step = %name,
                        error = %failure.error,
                        "Subject failed"
                    );
                    metrics::counter!("corpus_steps_total", "step" => name.to_string(), "outcome" => "failure")
                        .increment(1);
                    failed.push(failure);
                }
            }
        }
    }

    Ok(ExecutionReport {
        succeeded: live,
        failed,
    })
}

async fn run_step(
    step: &PipelineStep,
    ctx: &StepContext,
    cargos: Vec<Cargo>,
) -> StepResult<Vec<SubjectResult>> {
    let results = match step {
        PipelineStep::Single(single) => {
            let mut results = Vec::with_capacity(cargos.len());
            for cargo in cargos {
                ctx.check_cancelled()?;
                let subject_id = cargo.subject_id.clone();
                match single.run(ctx, cargo).await {
                    Ok(cargo) => results.push(Ok(cargo)),
                    Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                    Err(error) => results.push(Err(SubjectFailure {
                        subject_id,
                        step: single.name(),
                        error,
                    })),
                }
            }
            results
        }
        PipelineStep::Batched(batched) => batched.run_batch(ctx, cargos).await,
    };

    let cancelled = results.iter().any(|result| {
        matches!(
            result,
            Err(SubjectFailure {
                error: StepError::Cancelled,
                ..
            })
        )
    });
    if cancelled {
        return Err(StepError::Cancelled);
    }

    Ok(results)
}

/// Make a step's success durable for one subject
fn commit(ctx: &StepContext, step: StepName, index: usize, cargo: &Cargo) -> StepResult<()> {
    ctx.db.advance_status_flag(&cargo.subject_id, step)?;

    // Snapshots are diagnostic only
    if let Err(e) =
        ctx.db
            .save_cargo_snapshot(&ctx.job_id, &cargo.subject_id, index, &cargo.snapshot())
    {
        warn!(job_id = %ctx.job_id, doc_id = %cargo.subject_id, error = %e, "Failed to save cargo snapshot");
    }

    ctx.events.publish(ServiceEvent::DocumentProgress {
        document_id: cargo.subject_id.clone(),
        job_id: ctx.job_id.clone(),
        step,
    });

    Ok(())
}
