//! Pipeline results: sentence embeddings, index entries and cargo snapshots.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::Database;
use super::models::{IndexEntry, format_timestamp, parse_column};
use crate::error::{DatabaseError, ServiceResult};

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

impl Database {
    /// Replace all sentence embeddings of a document
    pub fn replace_sentence_embeddings(
        &self,
        document_id: &str,
        embeddings: &[(String, Vec<f32>)],
    ) -> ServiceResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        tx.execute(
            "DELETE FROM sentence_embeddings WHERE document_id = ?1",
            params![document_id],
        )
        .map_err(DatabaseError::Query)?;

        for (index, (sentence, embedding)) in embeddings.iter().enumerate() {
            tx.execute(
                "INSERT INTO sentence_embeddings (document_id, sentence_index, sentence, embedding) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    document_id,
                    index as i64,
                    sentence,
                    embedding_to_blob(embedding)
                ],
            )
            .map_err(DatabaseError::Query)?;
        }

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Sentence embeddings of a document in sentence order
    pub fn get_sentence_embeddings(&self, document_id: &str) -> ServiceResult<Vec<Vec<f32>>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT embedding FROM sentence_embeddings WHERE document_id = ?1 \
                 ORDER BY sentence_index",
            )
            .map_err(DatabaseError::Query)?;

        let embeddings = stmt
            .query_map(params![document_id], |row| {
                let blob: Vec<u8> = row.get(0)?;
                Ok(blob_to_embedding(&blob))
            })
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(embeddings)
    }

    /// Insert or overwrite a document's index entry
    pub fn upsert_index_entry(&self, entry: &IndexEntry) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO index_entries (document_id, project_id, doctype, language, content, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(document_id) DO UPDATE SET \
                project_id = excluded.project_id, doctype = excluded.doctype, \
                language = excluded.language, content = excluded.content, \
                updated_at = excluded.updated_at",
            params![
                entry.document_id,
                entry.project_id,
                entry.doctype.as_ref(),
                entry.language,
                entry.content,
                format_timestamp(Utc::now()),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    pub fn get_index_entry(&self, document_id: &str) -> ServiceResult<Option<IndexEntry>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            "SELECT document_id, project_id, doctype, language, content FROM index_entries \
             WHERE document_id = ?1",
            params![document_id],
            |row| {
                let doctype: String = row.get(2)?;
                Ok(IndexEntry {
                    document_id: row.get(0)?,
                    project_id: row.get(1)?,
                    doctype: parse_column(2, &doctype)?,
                    language: row.get(3)?,
                    content: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Persist a subject's cargo after a committed step (one row per subject)
    pub fn save_cargo_snapshot(
        &self,
        job_id: &str,
        subject_id: &str,
        step_index: usize,
        data: &serde_json::Value,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();
        let data = serde_json::to_string(data).map_err(DatabaseError::Serialization)?;

        conn.execute(
            "INSERT INTO cargo_snapshots (job_id, subject_id, step_index, data, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(job_id, subject_id) DO UPDATE SET \
                step_index = excluded.step_index, data = excluded.data, updated_at = excluded.updated_at",
            params![
                job_id,
                subject_id,
                step_index as i64,
                data,
                format_timestamp(Utc::now())
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Last snapshot for a subject: `(step_index, data)`
    #[cfg(test)]
    pub(crate) fn get_cargo_snapshot(
        &self,
        job_id: &str,
        subject_id: &str,
    ) -> ServiceResult<Option<(usize, serde_json::Value)>> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT step_index, data FROM cargo_snapshots WHERE job_id = ?1 AND subject_id = ?2",
                params![job_id, subject_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        row.map(|(index, data)| {
            serde_json::from_str(&data)
                .map(|value| (index as usize, value))
                .map_err(|e| DatabaseError::Serialization(e).into())
        })
        .transpose()
    }
}
