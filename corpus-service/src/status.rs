//! Per-document processing status.
//!
//! Each document carries one flag per step of its doctype's pipeline. A flag
//! only ever moves from pending to done, and only after the step's results
//! are durable. Storage lives in `db/status.rs`; this module holds the shapes
//! the rest of the service reads.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::db::Doctype;
use crate::pipeline::StepName;

/// Flags for one document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRecord {
    pub doc_id: String,
    pub doctype: Doctype,
    pub flags: BTreeMap<StepName, bool>,
}

impl StatusRecord {
    /// True once every step of the doctype's pipeline has completed
    pub fn is_finished(&self) -> bool {
        !self.flags.is_empty() && self.flags.values().all(|done| *done)
    }

    pub fn completed_steps(&self) -> Vec<StepName> {
        self.flags
            .iter()
            .filter(|(_, done)| **done)
            .map(|(step, _)| *step)
            .collect()
    }
}

/// Document counts for one slice of a project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounts {
    pub total: u64,
    pub finished: u64,
    pub in_progress: u64,
}

impl HealthCounts {
    pub fn new(total: u64, finished: u64) -> Self {
        Self {
            total,
            finished,
            in_progress: total.saturating_sub(finished),
        }
    }

    fn add(&mut self, other: HealthCounts) {
        self.total += other.total;
        self.finished += other.finished;
        self.in_progress += other.in_progress;
    }
}

/// Project-wide processing summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectHealth {
    pub project_id: String,
    pub overall: HealthCounts,
    pub by_doctype: BTreeMap<Doctype, HealthCounts>,
}

impl ProjectHealth {
    pub fn from_counts(
        project_id: impl Into<String>,
        by_doctype: BTreeMap<Doctype, HealthCounts>,
    ) -> Self {
        let mut overall = HealthCounts::default();
        for counts in by_doctype.values() {
            overall.add(*counts);
        }

        Self {
            project_id: project_id.into(),
            overall,
            by_doctype,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_finished_only_when_all_flags_done() {
        let mut record = StatusRecord {
            doc_id: "d1".to_string(),
            doctype: Doctype::Image,
            flags: BTreeMap::from([(StepName::Import, true), (StepName::ObjectDetect, false)]),
        };
        assert!(!record.is_finished());
        assert_eq!(record.completed_steps(), vec![StepName::Import]);

        record.flags.insert(StepName::ObjectDetect, true);
        assert!(record.is_finished());
    }

    #[test]
    fn test_project_health_sums_doctypes() {
        let health = ProjectHealth::from_counts(
            "p1",
            BTreeMap::from([
                (Doctype::Text, HealthCounts::new(3, 2)),
                (Doctype::Audio, HealthCounts::new(1, 0)),
            ]),
        );

        assert_eq!(health.overall, HealthCounts::new(4, 2));
        assert_eq!(health.overall.in_progress, 2);
    }
}
