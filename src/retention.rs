//! Periodic purge of expired jobs and their files.
//!
//! A sweep removes every job `JobStore::list_expired` reports, record first
//! and files after, then deletes anything under the storage root that no job
//! references anymore and that is older than a minimum age. Deletes are
//! idempotent: sweeping a job that is already gone is a no-op.

use crate::ingest::FileHandler;
use crate::jobs::{Job, JobId, JobStatus, JobStore, JobStoreError, RetentionPolicy};
use crate::server::metrics;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Minimum age before an unreferenced file is considered orphaned. Covers
/// the gap between an upload landing on disk and its job record existing.
pub const DEFAULT_ORPHAN_MIN_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub jobs_deleted: usize,
    pub orphans_deleted: usize,
    pub errors: usize,
}

pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    files: FileHandler,
    policy: RetentionPolicy,
    orphan_min_age: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>, files: FileHandler, policy: RetentionPolicy) -> Self {
        Self {
            store,
            files,
            policy,
            orphan_min_age: DEFAULT_ORPHAN_MIN_AGE,
        }
    }

    pub fn with_orphan_min_age(mut self, min_age: Duration) -> Self {
        self.orphan_min_age = min_age;
        self
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let expired = match self.store.list_expired(now, &self.policy) {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to list expired jobs: {}", e);
                report.errors += 1;
                Vec::new()
            }
        };

        for job_id in expired {
            match self.purge_job(&job_id, now).await {
                Ok(true) => report.jobs_deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to purge job {}: {}", job_id, e);
                    report.errors += 1;
                }
            }
        }

        let (orphans_deleted, orphan_errors) = self.sweep_orphans(SystemTime::from(now)).await;
        report.orphans_deleted = orphans_deleted;
        report.errors += orphan_errors;

        metrics::record_sweeper_deletions("job", report.jobs_deleted);
        metrics::record_sweeper_deletions("orphan", report.orphans_deleted);
        if report != SweepReport::default() {
            info!(
                "Retention sweep: {} jobs deleted, {} orphans deleted, {} errors",
                report.jobs_deleted, report.orphans_deleted, report.errors
            );
        } else {
            debug!("Retention sweep: nothing to delete");
        }
        report
    }

    /// Deletes a job's record and files. Returns whether a record was removed.
    ///
    /// The record only goes if its status is still the one judged expired, so
    /// a queued job a worker has just picked up is left alone. Files go after
    /// the record; a crash in between leaves orphans for the next sweep.
    async fn purge_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let job = match self.store.get(job_id) {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !self.policy.is_expired(&job, now) {
            return Ok(false);
        }

        match self.store.delete_if(job_id, job.status)? {
            Some(removed) => {
                self.remove_job_files(&removed).await;
                debug!("Purged job {} ({})", job_id, removed.status);
                Ok(true)
            }
            None => {
                debug!("Job {} changed while being purged, keeping it", job_id);
                Ok(false)
            }
        }
    }

    async fn remove_job_files(&self, job: &Job) {
        let uploads = std::iter::once(&job.input_ref).chain(job.reference_ref.as_ref());
        for upload in uploads {
            if let Err(e) = self.files.remove_upload(upload).await {
                warn!("Job {}: failed to remove upload: {}", job.id, e);
            }
        }
        if let Some(output) = &job.output_ref {
            if let Err(e) = self.files.remove_output(output).await {
                warn!("Job {}: failed to remove artifact: {}", job.id, e);
            }
        }
        if let Err(e) = self.files.cleanup_work_dir(&job.id).await {
            warn!("Job {}: failed to remove work directory: {}", job.id, e);
        }
    }

    /// Removes unreferenced entries older than the orphan minimum age.
    /// Returns (deleted, errors).
    pub async fn sweep_orphans(&self, now: SystemTime) -> (usize, usize) {
        let jobs = match self.store.list_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Failed to list jobs for orphan sweep: {}", e);
                return (0, 1);
            }
        };

        let mut upload_dirs: HashSet<PathBuf> = HashSet::new();
        let mut active_ids: HashSet<JobId> = HashSet::new();
        let mut outputs: HashSet<PathBuf> = HashSet::new();
        for job in &jobs {
            for upload in std::iter::once(&job.input_ref).chain(job.reference_ref.as_ref()) {
                if let Some(dir) = upload.path.parent() {
                    upload_dirs.insert(dir.to_path_buf());
                }
            }
            if !job.status.is_terminal() {
                active_ids.insert(job.id.clone());
            }
            if job.status == JobStatus::Completed {
                if let Some(output) = &job.output_ref {
                    outputs.insert(output.clone());
                }
            }
        }

        let uploads = self
            .remove_unreferenced(&self.files.uploads_dir(), |p| upload_dirs.contains(p), now)
            .await;
        let work = self
            .remove_unreferenced(
                &self.files.work_root(),
                |p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| active_ids.contains(n))
                        .unwrap_or(false)
                },
                now,
            )
            .await;
        let processed = self
            .remove_unreferenced(&self.files.processed_dir(), |p| outputs.contains(p), now)
            .await;

        let deleted = uploads.0 + work.0 + processed.0;
        let errors = uploads.1 + work.1 + processed.1;
        (deleted, errors)
    }

    async fn remove_unreferenced<F>(
        &self,
        dir: &Path,
        is_referenced: F,
        now: SystemTime,
    ) -> (usize, usize)
    where
        F: Fn(&Path) -> bool,
    {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (0, 0),
            Err(e) => {
                warn!("Failed to read {:?}: {}", dir, e);
                return (0, 1);
            }
        };

        let mut deleted = 0;
        let mut errors = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read directory entry in {:?}: {}", dir, e);
                    errors += 1;
                    break;
                }
            };
            let path = entry.path();
            if is_referenced(&path) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to get metadata for {:?}: {}", path, e);
                    errors += 1;
                    continue;
                }
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < self.orphan_min_age {
                continue;
            }

            let result = if metadata.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => {
                    debug!("Removed orphan {:?}", path);
                    deleted += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove orphan {:?}: {}", path, e);
                    errors += 1;
                }
            }
        }
        (deleted, errors)
    }

    /// Runs `sweep` every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Retention sweeper started: every {:?}, keeping jobs for {:?}",
                interval, self.policy.retention
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(Utc::now()).await;
                    }
                    _ = cancel.cancelled() => {
                        info!("Retention sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}
