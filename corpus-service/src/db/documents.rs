//! Document CRUD operations.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::Database;
use super::models::{Document, format_timestamp};
use crate::error::{DatabaseError, ServiceResult};
use crate::pipeline::StepName;

impl Database {
    /// Register a document together with a pending flag for each pipeline step
    pub fn insert_document(&self, doc: &Document, steps: &[StepName]) -> ServiceResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        tx.execute(
            "INSERT INTO documents (id, project_id, doctype, title, filename, file_path, content_hash, \
             mime_type, language, text, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                doc.id,
                doc.project_id,
                doc.doctype.as_ref(),
                doc.title,
                doc.filename,
                doc.file_path,
                doc.content_hash,
                doc.mime_type,
                doc.language,
                doc.text,
                format_timestamp(doc.created_at),
                format_timestamp(doc.updated_at),
            ],
        )
        .map_err(DatabaseError::Query)?;

        let now = format_timestamp(Utc::now());
        for step in steps {
            tx.execute(
                "INSERT OR IGNORE INTO document_status (document_id, step, done, updated_at) \
                 VALUES (?1, ?2, 0, ?3)",
                params![doc.id, step.as_ref(), now],
            )
            .map_err(DatabaseError::Query)?;
        }

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<Document>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            &format!("SELECT {} FROM documents WHERE id = ?1", Document::COLUMNS),
            params![id],
            Document::from_row,
        )
        .optional()
        .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Store extracted text and detected language
    pub fn update_document_content(
        &self,
        id: &str,
        text: &str,
        language: Option<&str>,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE documents SET text = ?2, language = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, text, language, format_timestamp(Utc::now())],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Doctype;
    use crate::testing::sample_document;

    #[test]
    fn test_insert_creates_pending_flags() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(
            &sample_document("d1", Doctype::Text),
            &[StepName::Import, StepName::Clean],
        )
        .unwrap();

        let record = db.get_status_record("d1").unwrap().unwrap();
        assert_eq!(record.flags.len(), 2);
        assert!(record.flags.values().all(|done| !done));
    }

    #[test]
    fn test_update_content() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("d1", Doctype::Text), &[])
            .unwrap();
        db.update_document_content("d1", "Hallo Welt.", Some("de"))
            .unwrap();

        let doc = db.get_document("d1").unwrap().unwrap();
        assert_eq!(doc.text.as_deref(), Some("Hallo Welt."));
        assert_eq!(doc.language.as_deref(), Some("de"));
        assert!(db.get_document("missing").unwrap().is_none());
    }
}
