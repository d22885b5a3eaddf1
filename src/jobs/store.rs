//! Job registry.
//!
//! `JobStore` is the single source of truth for job status. Only the
//! scheduler writes to it; HTTP handlers and the sweeper read and delete.

use super::models::{Job, JobId, JobStatus, NewJob, StatusUpdate};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Store error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Expiry rules applied by `JobStore::list_expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// How long a terminal job (and its files) is kept after `completed_at`.
    pub retention: Duration,
    /// How long a job may sit in `Queued` before it is considered stuck.
    pub stuck_queued_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(60 * 60),
            stuck_queued_max_age: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl RetentionPolicy {
    pub fn is_expired(&self, job: &Job, now: DateTime<Utc>) -> bool {
        match job.status {
            JobStatus::Completed | JobStatus::Failed => match job.completed_at {
                Some(completed_at) => elapsed_at_least(completed_at, now, self.retention),
                None => false,
            },
            JobStatus::Queued => {
                elapsed_at_least(job.created_at, now, self.stuck_queued_max_age)
            }
            // The processing timeout guarantees these become terminal.
            JobStatus::Processing => false,
        }
    }
}

fn elapsed_at_least(since: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    match since.checked_add_signed(window) {
        Some(deadline) => now > deadline,
        None => false,
    }
}

/// Storage for job records.
///
/// Implementations must be safe to call from many tasks at once, and
/// `update_status` must reject anything but a forward transition.
pub trait JobStore: Send + Sync {
    /// Registers a new job in `Queued` state and returns its fresh id.
    fn create(&self, new_job: NewJob) -> Result<JobId, JobStoreError>;

    /// Returns a copy of the job record.
    fn get(&self, id: &str) -> Result<Job, JobStoreError>;

    /// Applies a status change, returning the updated record.
    fn update_status(&self, id: &str, update: StatusUpdate) -> Result<Job, JobStoreError>;

    /// Removes a job record. Deleting an unknown id is a no-op returning `None`.
    fn delete(&self, id: &str) -> Result<Option<Job>, JobStoreError>;

    /// Removes a job record only while it is still in `expected` status.
    /// Returns `None` when the job is unknown or has moved on.
    fn delete_if(&self, id: &str, expected: JobStatus) -> Result<Option<Job>, JobStoreError>;

    /// Ids of the jobs whose records and files should be purged at `now`.
    fn list_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetentionPolicy,
    ) -> Result<Vec<JobId>, JobStoreError>;

    /// All job records, oldest first.
    fn list_jobs(&self) -> Result<Vec<Job>, JobStoreError>;

    /// Marks every non-terminal job as failed. Used at startup for durable
    /// stores, where jobs from a previous process can never finish.
    fn fail_interrupted(&self, reason: &str) -> Result<usize, JobStoreError>;

    /// Number of jobs per status.
    fn count_by_status(&self) -> Result<HashMap<JobStatus, usize>, JobStoreError> {
        let mut counts = HashMap::new();
        for job in self.list_jobs()? {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// Checks `update` against the current status of `job`.
pub(crate) fn check_transition(job: &Job, update: &StatusUpdate) -> Result<(), JobStoreError> {
    let to = update.target_status();
    if job.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(JobStoreError::InvalidTransition {
            job_id: job.id.clone(),
            from: job.status,
            to,
        })
    }
}

pub(crate) fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().to_string()
}

/// Process-local job store.
///
/// Records are copied out under a read lock, so pollers only ever wait for the
/// duration of a map lookup and a clone.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, new_job: NewJob) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write();
        let mut id = new_job_id();
        while jobs.contains_key(&id) {
            id = new_job_id();
        }
        jobs.insert(id.clone(), Job::new(id.clone(), new_job, Utc::now()));
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Job, JobStoreError> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))
    }

    fn update_status(&self, id: &str, update: StatusUpdate) -> Result<Job, JobStoreError> {
        let mut jobs = self.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        check_transition(job, &update)?;
        update.apply(job, Utc::now());
        Ok(job.clone())
    }

    fn delete(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        Ok(self.write().remove(id))
    }

    fn delete_if(&self, id: &str, expected: JobStatus) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write();
        match jobs.get(id) {
            Some(job) if job.status == expected => Ok(jobs.remove(id)),
            _ => Ok(None),
        }
    }

    fn list_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetentionPolicy,
    ) -> Result<Vec<JobId>, JobStoreError> {
        Ok(self
            .read()
            .values()
            .filter(|job| policy.is_expired(job, now))
            .map(|job| job.id.clone())
            .collect())
    }

    fn list_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = self.read().values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    fn fail_interrupted(&self, reason: &str) -> Result<usize, JobStoreError> {
        let now = Utc::now();
        let mut jobs = self.write();
        let mut count = 0;
        for job in jobs.values_mut() {
            if job.status.is_terminal() {
                continue;
            }
            // A queued job has to pass through processing first.
            if job.status == JobStatus::Queued {
                StatusUpdate::Processing.apply(job, now);
            }
            StatusUpdate::Failed {
                error: reason.to_string(),
                attempts: Vec::new(),
            }
            .apply(job, now);
            count += 1;
        }
        Ok(count)
    }
}
