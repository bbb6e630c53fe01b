//! Database schema migrations.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Current schema version, tracked in `PRAGMA user_version`
const SCHEMA_VERSION: i64 = 1;

/// Run all database migrations.
///
/// Called during database initialization; every statement is idempotent.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        -- Jobs: one row per submitted unit of work
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'finished', 'errored', 'aborted')),
            priority TEXT NOT NULL DEFAULT 'default',
            concurrency_class TEXT NOT NULL DEFAULT 'cpu',
            project_id TEXT NOT NULL,
            input TEXT NOT NULL,
            output TEXT,
            error TEXT,
            current_step INTEGER NOT NULL DEFAULT 0,
            steps TEXT NOT NULL DEFAULT '[]',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 0,
            next_run_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_dispatch
            ON jobs(status, concurrency_class, priority, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(job_type, project_id, created_at);

        -- Source documents
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            doctype TEXT NOT NULL,
            title TEXT NOT NULL,
            filename TEXT NOT NULL,
            file_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            language TEXT,
            text TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_documents_project ON documents(project_id, doctype);

        -- One row per (document, pipeline step); rows exist only for the doctype's steps
        CREATE TABLE IF NOT EXISTS document_status (
            document_id TEXT NOT NULL,
            step TEXT NOT NULL,
            done INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (document_id, step),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        -- Codes are per project and unique by name
        CREATE TABLE IF NOT EXISTS codes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (project_id, name)
        );

        CREATE TABLE IF NOT EXISTS annotations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            code_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            target TEXT NOT NULL,
            confidence REAL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
            FOREIGN KEY (code_id) REFERENCES codes(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_annotations_document ON annotations(document_id, kind);

        -- Embeddings stored as little-endian f32 BLOBs
        CREATE TABLE IF NOT EXISTS sentence_embeddings (
            document_id TEXT NOT NULL,
            sentence_index INTEGER NOT NULL,
            sentence TEXT NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (document_id, sentence_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS index_entries (
            document_id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            doctype TEXT NOT NULL,
            language TEXT,
            content TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        -- Last committed cargo per job subject, kept for debugging failed runs
        CREATE TABLE IF NOT EXISTS cargo_snapshots (
            job_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            step_index INTEGER NOT NULL,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (job_id, subject_id),
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        -- Runtime setting overrides (JSON values)
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )
    .map_err(DatabaseError::Query)?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(DatabaseError::Query)?;

    Ok(())
}
