//! Codes and annotations.

use chrono::Utc;
use rusqlite::{Connection, params};

use super::Database;
use super::models::{Annotation, AttachedObject, NewAnnotation, format_timestamp};
use crate::error::{DatabaseError, ServiceResult};

/// Exists-or-create lookup for a project's code
fn code_id(conn: &Connection, project_id: &str, name: &str) -> ServiceResult<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO codes (project_id, name, created_at) VALUES (?1, ?2, ?3)",
        params![project_id, name, format_timestamp(Utc::now())],
    )
    .map_err(DatabaseError::Query)?;

    let id = conn
        .query_row(
            "SELECT id FROM codes WHERE project_id = ?1 AND name = ?2",
            params![project_id, name],
            |row| row.get(0),
        )
        .map_err(DatabaseError::Query)?;

    Ok(id)
}

impl Database {
    /// Get the id of a code, creating it if the project does not have it yet
    pub fn get_or_create_code(&self, project_id: &str, name: &str) -> ServiceResult<i64> {
        let conn = self.conn.lock().unwrap();
        code_id(&conn, project_id, name)
    }

    /// Replace a document's annotations of one attachment kind.
    ///
    /// Delete-then-insert in one transaction, so re-running the producing step
    /// leaves exactly one copy.
    pub fn replace_annotations(
        &self,
        document_id: &str,
        project_id: &str,
        kind: &str,
        annotations: &[NewAnnotation],
    ) -> ServiceResult<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        tx.execute(
            "DELETE FROM annotations WHERE document_id = ?1 AND kind = ?2",
            params![document_id, kind],
        )
        .map_err(DatabaseError::Query)?;

        let now = format_timestamp(Utc::now());
        let mut inserted = 0;
        for annotation in annotations.iter().filter(|a| a.target.kind() == kind) {
            let code = code_id(&tx, project_id, &annotation.code_name)?;
            let target =
                serde_json::to_string(&annotation.target).map_err(DatabaseError::Serialization)?;

            tx.execute(
                "INSERT INTO annotations (document_id, code_id, kind, target, confidence, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![document_id, code, kind, target, annotation.confidence, now],
            )
            .map_err(DatabaseError::Query)?;
            inserted += 1;
        }

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(inserted)
    }

    /// All annotations on a document
    pub fn list_annotations(&self, document_id: &str) -> ServiceResult<Vec<Annotation>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT a.id, a.document_id, a.code_id, c.name, a.target, a.confidence \
                 FROM annotations a JOIN codes c ON c.id = a.code_id \
                 WHERE a.document_id = ?1 ORDER BY a.id",
            )
            .map_err(DatabaseError::Query)?;

        let annotations = stmt
            .query_map(params![document_id], |row| {
                let target: String = row.get(4)?;
                let target: AttachedObject = serde_json::from_str(&target).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                Ok(Annotation {
                    id: row.get(0)?,
                    document_id: row.get(1)?,
                    code_id: row.get(2)?,
                    code_name: row.get(3)?,
                    target,
                    confidence: row.get(5)?,
                })
            })
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(annotations)
    }
}
