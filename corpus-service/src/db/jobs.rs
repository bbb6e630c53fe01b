//! Job queue storage.
//!
//! Every status change goes through [`Database::transition_job`], which checks
//! the edge against [`JobStatus::can_transition_to`] and applies it with a
//! conditional update inside one transaction.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, ToSql, params};

use super::Database;
use super::models::{ConcurrencyClass, JobPriority, JobRecord, JobStatus, format_timestamp};
use crate::error::{DatabaseError, ServiceError, ServiceResult};

impl Database {
    /// Insert a freshly queued job
    pub fn insert_job(&self, job: &JobRecord) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        let input = serde_json::to_string(&job.input).map_err(DatabaseError::Serialization)?;
        let steps = serde_json::to_string(&job.steps).map_err(DatabaseError::Serialization)?;

        conn.execute(
            "INSERT INTO jobs (id, job_type, status, priority, concurrency_class, project_id, input, \
             current_step, steps, retry_count, max_retries, next_run_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id,
                job.job_type,
                job.status.as_ref(),
                job.priority.as_ref(),
                job.concurrency_class.as_ref(),
                job.project_id,
                input,
                job.current_step as i64,
                steps,
                job.retry_count,
                job.max_retries,
                format_timestamp(job.next_run_at),
                format_timestamp(job.created_at),
                format_timestamp(job.updated_at),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a job by ID
    pub fn get_job(&self, id: &str) -> ServiceResult<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JobRecord::COLUMNS),
            params![id],
            JobRecord::from_row,
        )
        .optional()
        .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Jobs of one type for a project, newest first
    pub fn list_jobs(&self, job_type: &str, project_id: &str) -> ServiceResult<Vec<JobRecord>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE job_type = ?1 AND project_id = ?2 \
                 ORDER BY created_at DESC, rowid DESC",
                JobRecord::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let jobs = stmt
            .query_map(params![job_type, project_id], JobRecord::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(jobs)
    }

    /// Jobs currently in `status`, oldest first
    pub fn jobs_with_status(&self, status: JobStatus) -> ServiceResult<Vec<JobRecord>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at",
                JobRecord::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let jobs = stmt
            .query_map(params![status.as_ref()], JobRecord::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(jobs)
    }

    /// Atomically claim the oldest dispatchable job of a class and priority.
    ///
    /// The claim is a conditional `Queued -> Running` update, so two workers can
    /// never both win the same row.
    pub fn claim_next_job(
        &self,
        class: ConcurrencyClass,
        priority: JobPriority,
        now: DateTime<Utc>,
    ) -> ServiceResult<Option<JobRecord>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(DatabaseError::Query)?;
        let now = format_timestamp(now);

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs \
                 WHERE status = 'queued' AND concurrency_class = ?1 AND priority = ?2 AND next_run_at <= ?3 \
                 ORDER BY next_run_at, created_at LIMIT 1",
                params![class.as_ref(), priority.as_ref(), now],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let claimed = tx
            .execute(
                "UPDATE jobs SET status = 'running', started_at = ?2, updated_at = ?2, \
                 finished_at = NULL, current_step = 0 \
                 WHERE id = ?1 AND status = 'queued'",
                params![id, now],
            )
            .map_err(DatabaseError::Query)?;

        if claimed == 0 {
            return Ok(None);
        }

        let job = tx
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JobRecord::COLUMNS),
                params![id],
                JobRecord::from_row,
            )
            .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(Some(job))
    }

    /// `Running -> Finished`, storing the output
    pub fn finish_job(&self, id: &str, output: &serde_json::Value) -> ServiceResult<JobRecord> {
        let output = serde_json::to_string(output).map_err(DatabaseError::Serialization)?;
        self.transition_job(
            id,
            JobStatus::Finished,
            "output = ?5, error = NULL, finished_at = ?2",
            &[&output],
        )
    }

    /// `Running -> Errored`, recording the message
    pub fn fail_job(&self, id: &str, error: &str) -> ServiceResult<JobRecord> {
        self.transition_job(
            id,
            JobStatus::Errored,
            "error = ?5, finished_at = ?2",
            &[&error],
        )
    }

    /// `Queued | Running -> Aborted`
    pub fn abort_job(&self, id: &str) -> ServiceResult<JobRecord> {
        self.transition_job(id, JobStatus::Aborted, "finished_at = ?2", &[])
    }

    /// `Errored -> Queued`; the last error is kept until the next attempt ends
    pub fn requeue_job(
        &self,
        id: &str,
        retry_count: u32,
        next_run_at: DateTime<Utc>,
    ) -> ServiceResult<JobRecord> {
        let next_run_at = format_timestamp(next_run_at);
        self.transition_job(
            id,
            JobStatus::Queued,
            "retry_count = ?5, next_run_at = ?6, current_step = 0, output = NULL, \
             started_at = NULL, finished_at = NULL",
            &[&retry_count, &next_run_at],
        )
    }

    /// Record which step a running job has reached
    pub fn update_job_step(&self, id: &str, step_index: usize) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE jobs SET current_step = ?2, updated_at = ?3 WHERE id = ?1 AND status = 'running'",
            params![id, step_index as i64, format_timestamp(Utc::now())],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Replace a job's stored input (re-enrichment before a retry)
    pub fn update_job_input(&self, id: &str, input: &serde_json::Value) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();
        let input = serde_json::to_string(input).map_err(DatabaseError::Serialization)?;

        conn.execute(
            "UPDATE jobs SET input = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, input, format_timestamp(Utc::now())],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Delete terminal jobs last touched before `cutoff`
    pub fn delete_terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();

        let deleted = conn
            .execute(
                "DELETE FROM jobs WHERE status IN ('finished', 'errored', 'aborted') AND updated_at < ?1",
                params![format_timestamp(cutoff)],
            )
            .map_err(DatabaseError::Query)?;

        Ok(deleted)
    }

    /// Number of queued jobs per concurrency class
    pub fn queued_job_counts(&self) -> ServiceResult<Vec<(ConcurrencyClass, u64)>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT concurrency_class, COUNT(*) FROM jobs WHERE status = 'queued' \
                 GROUP BY concurrency_class",
            )
            .map_err(DatabaseError::Query)?;

        let counts = stmt
            .query_map([], |row| {
                let class: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((super::models::parse_column(0, &class)?, count as u64))
            })
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(counts)
    }

    /// Clear any backoff on a job
    #[cfg(test)]
    pub(crate) fn make_dispatchable(&self, id: &str) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET next_run_at = ?2 WHERE id = ?1",
            params![id, format_timestamp(Utc::now() - chrono::Duration::seconds(1))],
        )
        .unwrap();
    }

    /// Apply one status edge. `assignments` may reference `?2` (now) and
    /// extra parameters starting at `?5`.
    fn transition_job(
        &self,
        id: &str,
        to: JobStatus,
        assignments: &str,
        extra: &[&dyn ToSql],
    ) -> ServiceResult<JobRecord> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let current = current.ok_or_else(|| ServiceError::JobNotFound {
            job_id: id.to_string(),
        })?;
        let from: JobStatus = current.parse().map_err(|_| ServiceError::Internal {
            message: format!("Job {} has unknown status '{}'", id, current),
        })?;

        if !from.can_transition_to(to) {
            return Err(ServiceError::InvalidTransition {
                job_id: id.to_string(),
                from,
                to,
            });
        }

        let now = format_timestamp(Utc::now());
        let to_str = to.as_ref();
        let from_str = from.as_ref();
        let sql = format!(
            "UPDATE jobs SET status = ?1, updated_at = ?2, {} WHERE id = ?3 AND status = ?4",
            assignments
        );

        let mut bound: Vec<&dyn ToSql> = vec![&to_str, &now, &id, &from_str];
        bound.extend_from_slice(extra);

        tx.execute(&sql, bound.as_slice())
            .map_err(DatabaseError::Query)?;

        let job = tx
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JobRecord::COLUMNS),
                params![id],
                JobRecord::from_row,
            )
            .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::queued_job;
    use chrono::Duration;

    #[test]
    fn test_claim_is_exclusive() {
        let db = Database::open_in_memory().unwrap();
        db.insert_job(&queued_job("j1", JobPriority::Default)).unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let first = db
            .claim_next_job(ConcurrencyClass::Cpu, JobPriority::Default, now)
            .unwrap();
        let second = db
            .claim_next_job(ConcurrencyClass::Cpu, JobPriority::Default, now)
            .unwrap();

        let first = first.unwrap();
        assert_eq!(first.status, JobStatus::Running);
        assert!(first.started_at.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn test_claim_respects_class_priority_and_backoff() {
        let db = Database::open_in_memory().unwrap();
        let mut delayed = queued_job("j1", JobPriority::High);
        delayed.next_run_at = Utc::now() + Duration::hours(1);
        db.insert_job(&delayed).unwrap();

        let now = Utc::now() + Duration::seconds(1);
        assert!(
            db.claim_next_job(ConcurrencyClass::Cpu, JobPriority::High, now)
                .unwrap()
                .is_none()
        );
        assert!(
            db.claim_next_job(ConcurrencyClass::Gpu, JobPriority::High, now + Duration::hours(2))
                .unwrap()
                .is_none()
        );
        assert!(
            db.claim_next_job(ConcurrencyClass::Cpu, JobPriority::High, now + Duration::hours(2))
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_job(&queued_job("j1", JobPriority::Default)).unwrap();

        let err = db.finish_job("j1", &serde_json::json!({})).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidTransition {
                from: JobStatus::Queued,
                to: JobStatus::Finished,
                ..
            }
        ));

        // Unchanged after the rejected edge
        let job = db.get_job("j1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_fail_then_requeue() {
        let db = Database::open_in_memory().unwrap();
        db.insert_job(&queued_job("j1", JobPriority::Default)).unwrap();
        db.claim_next_job(
            ConcurrencyClass::Cpu,
            JobPriority::Default,
            Utc::now() + Duration::seconds(1),
        )
        .unwrap();
        db.update_job_step("j1", 3).unwrap();

        let errored = db.fail_job("j1", "inference unavailable").unwrap();
        assert_eq!(errored.status, JobStatus::Errored);
        assert!(errored.finished_at.is_some());

        let requeued = db.requeue_job("j1", 1, Utc::now()).unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.current_step, 0);
        assert_eq!(requeued.error.as_deref(), Some("inference unavailable"));
        assert!(requeued.finished_at.is_none());
    }

    #[test]
    fn test_abort_from_queued_and_not_from_finished() {
        let db = Database::open_in_memory().unwrap();
        db.insert_job(&queued_job("j1", JobPriority::Default)).unwrap();

        assert_eq!(db.abort_job("j1").unwrap().status, JobStatus::Aborted);
        assert!(matches!(
            db.abort_job("j1"),
            Err(ServiceError::InvalidTransition { .. })
        ));
        assert!(matches!(
            db.abort_job("missing"),
            Err(ServiceError::JobNotFound { .. })
        ));
    }

    #[test]
    fn test_list_jobs_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let mut older = queued_job("old", JobPriority::Default);
        older.created_at = Utc::now() - Duration::minutes(5);
        db.insert_job(&older).unwrap();
        db.insert_job(&queued_job("new", JobPriority::Default)).unwrap();

        let ids: Vec<_> = db
            .list_jobs("text_pipeline", "p1")
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert!(db.list_jobs("text_pipeline", "p2").unwrap().is_empty());
    }

    #[test]
    fn test_retention_only_removes_terminal_jobs() {
        let db = Database::open_in_memory().unwrap();
        db.insert_job(&queued_job("queued", JobPriority::Default)).unwrap();
        db.insert_job(&queued_job("aborted", JobPriority::Default)).unwrap();
        db.abort_job("aborted").unwrap();

        let deleted = db
            .delete_terminal_jobs_before(Utc::now() + Duration::seconds(5))
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(db.get_job("queued").unwrap().is_some());
        assert!(db.get_job("aborted").unwrap().is_none());
    }
}
