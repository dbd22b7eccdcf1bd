//! OCR job records: creation, guarded status transitions and claiming.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{JobCounts, JobStatus, OcrJob};

use super::{parse_opt_ts, parse_text, parse_ts, ts, Store, StoreError};

const JOB_COLUMNS: &str =
    "id, region_id, status, attempts, error, worker_id, created_at, started_at, finished_at, updated_at";

/// Result of an enqueue operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// New job created
    Queued(String),
    /// A job for the region is already queued or running
    AlreadyQueued(String),
}

impl EnqueueResult {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Queued(id) | Self::AlreadyQueued(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

impl Store {
    /// Create a queued job for a region unconditionally
    pub fn create_ocr_job(&self, region_id: &str) -> Result<OcrJob, StoreError> {
        let conn = self.lock()?;
        insert_job(&conn, region_id)
    }

    /// Queue OCR for a region unless a job is already in flight.
    ///
    /// The region must exist and carry both verse ids.
    pub fn enqueue_region(&self, region_id: &str) -> Result<EnqueueResult, StoreError> {
        let conn = self.lock()?;

        let tagging: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT start_verse, end_verse FROM regions WHERE id = ?1",
                [region_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match tagging {
            None => return Err(StoreError::not_found("region", region_id)),
            Some((Some(_), Some(_))) => {}
            Some(_) => {
                return Err(StoreError::InvalidInput(format!(
                    "region {} needs both start and end verse before OCR",
                    region_id
                )))
            }
        }

        let in_flight: Option<String> = conn
            .query_row(
                "SELECT id FROM ocr_jobs
                 WHERE region_id = ?1 AND status IN ('queued', 'running')
                 ORDER BY created_at ASC LIMIT 1",
                [region_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = in_flight {
            return Ok(EnqueueResult::AlreadyQueued(id));
        }

        let job = insert_job(&conn, region_id)?;
        Ok(EnqueueResult::Queued(job.id))
    }

    pub fn get_job(&self, id: &str) -> Result<Option<OcrJob>, StoreError> {
        let conn = self.lock()?;
        fetch_job(&conn, id)
    }

    /// Jobs ordered by creation time, optionally filtered by status
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<OcrJob>, StoreError> {
        let conn = self.lock()?;
        let jobs = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM ocr_jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
                    JOB_COLUMNS
                ))?;
                let rows = stmt.query_map([status.as_str()], job_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM ocr_jobs ORDER BY created_at ASC, rowid ASC",
                    JOB_COLUMNS
                ))?;
                let rows = stmt.query_map([], job_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(jobs)
    }

    pub fn job_counts(&self) -> Result<JobCounts, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM ocr_jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((parse_text::<JobStatus>(0, &status)?, count as usize))
        })?;

        let mut counts = JobCounts::default();
        for row in rows {
            let (status, count) = row?;
            match status {
                JobStatus::Queued => counts.queued = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// Move a job to `status`.
    ///
    /// Entering `running` increments `attempts`; entering `failed` records
    /// `error`. Terminal jobs cannot be moved again (repeating the same
    /// terminal status is a no-op).
    pub fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<OcrJob, StoreError> {
        let conn = self.lock()?;
        let current = fetch_job(&conn, id)?.ok_or_else(|| StoreError::not_found("job", id))?;

        if current.status.is_terminal() {
            if current.status == status {
                return Ok(current);
            }
            return Err(StoreError::InvalidTransition {
                job_id: id.to_string(),
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = ts(Utc::now());
        match status {
            JobStatus::Running => {
                conn.execute(
                    "UPDATE ocr_jobs
                     SET status = 'running', attempts = attempts + 1,
                         started_at = ?2, finished_at = NULL, updated_at = ?2
                     WHERE id = ?1",
                    params![id, now],
                )?;
            }
            JobStatus::Queued => {
                conn.execute(
                    "UPDATE ocr_jobs
                     SET status = 'queued', started_at = NULL, worker_id = NULL, updated_at = ?2
                     WHERE id = ?1",
                    params![id, now],
                )?;
            }
            JobStatus::Completed => {
                conn.execute(
                    "UPDATE ocr_jobs
                     SET status = 'completed', error = NULL, finished_at = ?2, updated_at = ?2
                     WHERE id = ?1",
                    params![id, now],
                )?;
            }
            JobStatus::Failed => {
                conn.execute(
                    "UPDATE ocr_jobs
                     SET status = 'failed', error = COALESCE(?2, error), finished_at = ?3, updated_at = ?3
                     WHERE id = ?1",
                    params![id, error, now],
                )?;
            }
        }

        fetch_job(&conn, id)?.ok_or_else(|| StoreError::not_found("job", id))
    }

    /// Atomically claim the oldest queued job for `worker_id`.
    ///
    /// Ordering is FIFO by creation time, ties broken by the lowest priority
    /// tier of the region's witness. The `queued -> running` update is guarded
    /// on the current status, so a job lost to another process is skipped and
    /// the next candidate is tried.
    pub fn claim_next_job(&self, worker_id: &str) -> Result<Option<OcrJob>, StoreError> {
        self.claim_next(worker_id, None)
    }

    /// Like [`Store::claim_next_job`], restricted to regions of one witness
    pub fn claim_next_job_for_witness(
        &self,
        worker_id: &str,
        witness_id: &str,
    ) -> Result<Option<OcrJob>, StoreError> {
        self.claim_next(worker_id, Some(witness_id))
    }

    fn claim_next(
        &self,
        worker_id: &str,
        witness_id: Option<&str>,
    ) -> Result<Option<OcrJob>, StoreError> {
        let conn = self.lock()?;

        loop {
            let candidate: Option<String> = conn
                .query_row(
                    "SELECT j.id
                     FROM ocr_jobs j
                     LEFT JOIN regions r ON r.id = j.region_id
                     LEFT JOIN witnesses w ON w.id = r.witness_id
                     WHERE j.status = 'queued'
                       AND (?1 IS NULL OR r.witness_id = ?1)
                     ORDER BY j.created_at ASC,
                              COALESCE(w.priority_tier, 2147483647) ASC,
                              j.rowid ASC
                     LIMIT 1",
                    params![witness_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(job_id) = candidate else {
                return Ok(None);
            };

            let now = ts(Utc::now());
            let claimed = conn.execute(
                "UPDATE ocr_jobs
                 SET status = 'running', attempts = attempts + 1, worker_id = ?2,
                     started_at = ?3, finished_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND status = 'queued'",
                params![job_id, worker_id, now],
            )?;

            if claimed == 1 {
                return fetch_job(&conn, &job_id);
            }
        }
    }

    /// Requeue running jobs whose start time is older than `stale_after`.
    /// Returns the ids that were requeued.
    pub fn requeue_stale_jobs(&self, stale_after: Duration) -> Result<Vec<String>, StoreError> {
        let window = chrono::Duration::from_std(stale_after)
            .map_err(|e| StoreError::InvalidInput(format!("staleness window: {}", e)))?;
        let cutoff = ts(Utc::now() - window);

        let conn = self.lock()?;
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM ocr_jobs
                 WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?1
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([&cutoff], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let now = ts(Utc::now());
        let mut requeued = Vec::with_capacity(ids.len());
        for id in ids {
            let changed = conn.execute(
                "UPDATE ocr_jobs
                 SET status = 'queued', started_at = NULL, worker_id = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'running' AND started_at < ?3",
                params![id, now, cutoff],
            )?;
            if changed == 1 {
                tracing::info!(job_id = %id, "Requeued stale OCR job");
                requeued.push(id);
            }
        }
        Ok(requeued)
    }
}

fn insert_job(conn: &Connection, region_id: &str) -> Result<OcrJob, StoreError> {
    let id = Uuid::new_v4().to_string();
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO ocr_jobs (id, region_id, status, attempts, created_at, updated_at)
         VALUES (?1, ?2, 'queued', 0, ?3, ?3)",
        params![id, region_id, now],
    )?;
    fetch_job(conn, &id)?.ok_or_else(|| StoreError::not_found("job", id))
}

fn fetch_job(conn: &Connection, id: &str) -> Result<Option<OcrJob>, StoreError> {
    let job = conn
        .query_row(
            &format!("SELECT {} FROM ocr_jobs WHERE id = ?1", JOB_COLUMNS),
            [id],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<OcrJob> {
    let status: String = row.get(2)?;
    Ok(OcrJob {
        id: row.get(0)?,
        region_id: row.get(1)?,
        status: parse_text(2, &status)?,
        attempts: row.get(3)?,
        error: row.get(4)?,
        worker_id: row.get(5)?,
        created_at: parse_ts(6, row.get(6)?)?,
        started_at: parse_opt_ts(7, row.get(7)?)?,
        finished_at: parse_opt_ts(8, row.get(8)?)?,
        updated_at: parse_ts(9, row.get(9)?)?,
    })
}
