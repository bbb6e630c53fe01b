//! Status flag storage.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::Database;
use super::models::{Doctype, format_timestamp, parse_column};
use crate::error::{DatabaseError, ServiceError, ServiceResult};
use crate::pipeline::StepName;
use crate::status::{HealthCounts, ProjectHealth, StatusRecord};

impl Database {
    /// Flags for a document, or `None` if the document does not exist
    pub fn get_status_record(&self, doc_id: &str) -> ServiceResult<Option<StatusRecord>> {
        let conn = self.conn.lock().unwrap();

        let doctype: Option<String> = conn
            .query_row(
                "SELECT doctype FROM documents WHERE id = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some(doctype) = doctype else {
            return Ok(None);
        };
        let doctype: Doctype = parse_column(0, &doctype).map_err(DatabaseError::Query)?;

        let mut stmt = conn
            .prepare("SELECT step, done FROM document_status WHERE document_id = ?1")
            .map_err(DatabaseError::Query)?;

        let flags = stmt
            .query_map(params![doc_id], |row| {
                let step: String = row.get(0)?;
                let done: bool = row.get(1)?;
                Ok((parse_column::<StepName>(0, &step)?, done))
            })
            .map_err(DatabaseError::Query)?
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(Some(StatusRecord {
            doc_id: doc_id.to_string(),
            doctype,
            flags,
        }))
    }

    /// Mark a step done for a document. Re-advancing a done flag is a no-op.
    ///
    /// Only steps registered for the document's doctype have a row; anything
    /// else is rejected with `UnknownStatusFlag`.
    pub fn advance_status_flag(&self, doc_id: &str, step: StepName) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        let updated = conn
            .execute(
                "UPDATE document_status SET done = 1, updated_at = ?3 \
                 WHERE document_id = ?1 AND step = ?2",
                params![doc_id, step.as_ref(), format_timestamp(Utc::now())],
            )
            .map_err(DatabaseError::Query)?;

        if updated > 0 {
            return Ok(());
        }

        let doctype: Option<String> = conn
            .query_row(
                "SELECT doctype FROM documents WHERE id = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        match doctype {
            None => Err(ServiceError::DocumentNotFound {
                document_id: doc_id.to_string(),
            }),
            Some(doctype) => Err(ServiceError::UnknownStatusFlag {
                step,
                doctype: parse_column(0, &doctype).map_err(DatabaseError::Query)?,
            }),
        }
    }

    /// Per-doctype document counts for a project. A document is finished when
    /// none of its flags is pending.
    pub fn project_health(&self, project_id: &str) -> ServiceResult<ProjectHealth> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT d.doctype, COUNT(*), \
                        SUM(CASE WHEN s.pending = 0 THEN 1 ELSE 0 END) \
                 FROM documents d \
                 JOIN (SELECT document_id, SUM(CASE WHEN done = 0 THEN 1 ELSE 0 END) AS pending \
                       FROM document_status GROUP BY document_id) s \
                   ON s.document_id = d.id \
                 WHERE d.project_id = ?1 \
                 GROUP BY d.doctype",
            )
            .map_err(DatabaseError::Query)?;

        let by_doctype = stmt
            .query_map(params![project_id], |row| {
                let doctype: String = row.get(0)?;
                let total: i64 = row.get(1)?;
                let finished: i64 = row.get(2)?;
                Ok((
                    parse_column::<Doctype>(0, &doctype)?,
                    HealthCounts::new(total as u64, finished as u64),
                ))
            })
            .map_err(DatabaseError::Query)?
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(ProjectHealth::from_counts(project_id, by_doctype))
    }
}
