//! SQLite-backed job store.
//!
//! Keeps job records across restarts. Structured fields (stored files, params,
//! tier attempts) are serialized as JSON text columns; timestamps are Unix
//! milliseconds.

use super::models::{
    ExportFormat, Job, JobId, JobStatus, MasteringMethod, MethodUsed, NewJob, StatusUpdate,
};
use super::store::{check_transition, new_job_id, JobStore, JobStoreError, RetentionPolicy};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const JOBS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS mastering_jobs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,

    -- Timestamps (Unix milliseconds)
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,

    -- Inputs (JSON encoded StoredFile)
    input_ref TEXT NOT NULL,
    reference_ref TEXT,

    method_requested TEXT NOT NULL,
    params TEXT NOT NULL,
    export_format TEXT NOT NULL,

    -- Outcome
    output_ref TEXT,
    method_used TEXT,
    error_message TEXT,
    attempts TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_mastering_jobs_status ON mastering_jobs(status);
CREATE INDEX IF NOT EXISTS idx_mastering_jobs_completed ON mastering_jobs(completed_at);
"#;

const JOB_COLUMNS: &str = "id, status, created_at, started_at, completed_at, input_ref, \
    reference_ref, method_requested, params, export_format, output_ref, method_used, \
    error_message, attempts";

pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

/// Raw column values, decoded into a `Job` outside the rusqlite row callback.
struct JobRow {
    id: String,
    status: String,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    input_ref: String,
    reference_ref: Option<String>,
    method_requested: String,
    params: String,
    export_format: String,
    output_ref: Option<String>,
    method_used: Option<String>,
    error_message: Option<String>,
    attempts: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            input_ref: row.get("input_ref")?,
            reference_ref: row.get("reference_ref")?,
            method_requested: row.get("method_requested")?,
            params: row.get("params")?,
            export_format: row.get("export_format")?,
            output_ref: row.get("output_ref")?,
            method_used: row.get("method_used")?,
            error_message: row.get("error_message")?,
            attempts: row.get("attempts")?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let job_id = self.id.clone();
        let decode = || -> Result<Job> {
            Ok(Job {
                id: self.id,
                status: self.status.parse::<JobStatus>().map_err(|e: String| anyhow!(e))?,
                created_at: from_millis(self.created_at)?,
                started_at: self.started_at.map(from_millis).transpose()?,
                completed_at: self.completed_at.map(from_millis).transpose()?,
                input_ref: serde_json::from_str(&self.input_ref)?,
                reference_ref: self
                    .reference_ref
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?,
                output_ref: self.output_ref.map(PathBuf::from),
                method_requested: self
                    .method_requested
                    .parse::<MasteringMethod>()
                    .map_err(|e: String| anyhow!(e))?,
                method_used: self
                    .method_used
                    .map(|m| m.parse::<MethodUsed>().map_err(|e: String| anyhow!(e)))
                    .transpose()?,
                params: serde_json::from_str(&self.params)?,
                error: self.error_message,
                export_format: self
                    .export_format
                    .parse::<ExportFormat>()
                    .map_err(|e: String| anyhow!(e))?,
                attempts: serde_json::from_str(&self.attempts)?,
            })
        };
        decode().with_context(|| format!("Corrupt job row {}", job_id))
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

/// Current time at the precision the table stores.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

fn window_millis(window: std::time::Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

impl SqliteJobStore {
    /// Open or create a job database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open job database: {:?}", path))?;
        conn.execute_batch(JOBS_SCHEMA_SQL)
            .context("Failed to apply job schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(JOBS_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(conn: &Connection, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM mastering_jobs WHERE id = ?1", JOB_COLUMNS);
        let row = conn
            .query_row(&sql, params![id], JobRow::from_row)
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    fn insert(conn: &Connection, job: &Job) -> Result<()> {
        let sql = format!(
            "INSERT INTO mastering_jobs ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            JOB_COLUMNS
        );
        conn.execute(
            &sql,
            params![
                job.id,
                job.status.as_str(),
                job.created_at.timestamp_millis(),
                job.started_at.map(|t| t.timestamp_millis()),
                job.completed_at.map(|t| t.timestamp_millis()),
                serde_json::to_string(&job.input_ref)?,
                job.reference_ref
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                job.method_requested.as_str(),
                serde_json::to_string(&job.params)?,
                job.export_format.extension(),
                job.output_ref
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                job.method_used.map(|m| m.as_str()),
                job.error,
                serde_json::to_string(&job.attempts)?,
            ],
        )
        .context("Failed to insert job")?;
        Ok(())
    }

    /// Writes the mutable part of a record back.
    fn save_status(conn: &Connection, job: &Job) -> Result<()> {
        conn.execute(
            "UPDATE mastering_jobs SET
                status = ?2,
                started_at = ?3,
                completed_at = ?4,
                output_ref = ?5,
                method_used = ?6,
                error_message = ?7,
                attempts = ?8
            WHERE id = ?1",
            params![
                job.id,
                job.status.as_str(),
                job.started_at.map(|t| t.timestamp_millis()),
                job.completed_at.map(|t| t.timestamp_millis()),
                job.output_ref
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                job.method_used.map(|m| m.as_str()),
                job.error,
                serde_json::to_string(&job.attempts)?,
            ],
        )
        .context("Failed to update job")?;
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, new_job: NewJob) -> Result<JobId, JobStoreError> {
        let conn = self.conn();
        let id = new_job_id();
        let job = Job::new(id.clone(), new_job, now_millis());
        Self::insert(&conn, &job)?;
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Job, JobStoreError> {
        let conn = self.conn();
        Self::load(&conn, id)?.ok_or_else(|| JobStoreError::NotFound(id.to_string()))
    }

    fn update_status(&self, id: &str, update: StatusUpdate) -> Result<Job, JobStoreError> {
        let conn = self.conn();
        let mut job =
            Self::load(&conn, id)?.ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        check_transition(&job, &update)?;
        update.apply(&mut job, now_millis());
        Self::save_status(&conn, &job)?;
        Ok(job)
    }

    fn delete(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        let conn = self.conn();
        let job = Self::load(&conn, id)?;
        if job.is_some() {
            conn.execute("DELETE FROM mastering_jobs WHERE id = ?1", params![id])
                .context("Failed to delete job")?;
        }
        Ok(job)
    }

    fn delete_if(&self, id: &str, expected: JobStatus) -> Result<Option<Job>, JobStoreError> {
        let conn = self.conn();
        let job = match Self::load(&conn, id)? {
            Some(job) if job.status == expected => job,
            _ => return Ok(None),
        };
        conn.execute(
            "DELETE FROM mastering_jobs WHERE id = ?1 AND status = ?2",
            params![id, expected.as_str()],
        )
        .context("Failed to delete job")?;
        Ok(Some(job))
    }

    fn list_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetentionPolicy,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let now_ms = now.timestamp_millis();
        let terminal_cutoff = now_ms.saturating_sub(window_millis(policy.retention));
        let queued_cutoff = now_ms.saturating_sub(window_millis(policy.stuck_queued_max_age));

        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM mastering_jobs
                 WHERE (status IN ('completed', 'failed') AND completed_at < ?1)
                    OR (status = 'queued' AND created_at < ?2)",
            )
            .context("Failed to prepare expiry query")?;
        let ids = stmt
            .query_map(params![terminal_cutoff, queued_cutoff], |row| row.get(0))
            .context("Failed to query expired jobs")?
            .collect::<rusqlite::Result<Vec<String>>>()
            .context("Failed to read expired jobs")?;
        Ok(ids)
    }

    fn list_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM mastering_jobs ORDER BY created_at ASC",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).context("Failed to prepare job listing")?;
        let rows = stmt
            .query_map([], JobRow::from_row)
            .context("Failed to list jobs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read jobs")?;
        let jobs = rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn fail_interrupted(&self, reason: &str) -> Result<usize, JobStoreError> {
        let now = now_millis().timestamp_millis();
        let conn = self.conn();
        let count = conn
            .execute(
                "UPDATE mastering_jobs SET
                    status = ?1,
                    started_at = COALESCE(started_at, ?2),
                    completed_at = ?2,
                    error_message = ?3
                WHERE status IN (?4, ?5)",
                params![
                    JobStatus::Failed.as_str(),
                    now,
                    reason,
                    JobStatus::Queued.as_str(),
                    JobStatus::Processing.as_str(),
                ],
            )
            .context("Failed to mark interrupted jobs")?;
        Ok(count)
    }
}
