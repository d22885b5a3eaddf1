use crate::ingest::{FileHandler, FileHandlerError, IngestError, MediaIngest, UploadRole};
use crate::jobs::{
    ExportFormat, Job, JobId, JobStore, JobStoreError, MasteringMethod, MasteringParams,
    NewJob, StatusUpdate, StoredFile, TierAttempt,
};
use crate::mastering::{
    MasteringOutcome, MasteringPipeline, PipelineError, ReferenceInput, TierContext,
};
use crate::server::metrics;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Tries at writing a job's terminal status before giving up.
const TERMINAL_WRITE_ATTEMPTS: u32 = 5;

/// Pause after the first failed terminal write, doubled after each retry.
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// A validated upload form, ready to become a job.
#[derive(Debug, Clone)]
pub struct MasteringRequest {
    pub target: StoredFile,
    pub reference: Option<StoredFile>,
    pub method: MasteringMethod,
    pub params: MasteringParams,
    pub export_format: ExportFormat,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Jobs allowed in `processing` at the same time.
    pub worker_concurrency: usize,
    /// Wall-clock budget for ingest plus pipeline, per job.
    pub processing_timeout: Duration,
    /// Panic on illegal status transitions instead of logging them.
    pub strict_transitions: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 2,
            processing_timeout: Duration::from_secs(600),
            strict_transitions: false,
        }
    }
}

/// Why a job ended up failed.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("storage error: {0}")]
    Storage(#[from] FileHandlerError),
}

impl JobFailure {
    fn into_attempts(self) -> Vec<TierAttempt> {
        match self {
            JobFailure::Pipeline(e) => e.attempts,
            _ => Vec::new(),
        }
    }
}

/// Accepts jobs and runs them on a bounded pool of workers.
///
/// `submit` only records the job and spawns its task; the task waits for a
/// worker slot, then moves the job through `processing` to a terminal status.
/// Each job runs in its own task under a timeout, so a panicking or stuck job
/// still ends up `failed` without affecting the others.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Arc<dyn JobStore>,
    files: FileHandler,
    ingest: MediaIngest,
    pipeline: MasteringPipeline,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        files: FileHandler,
        ingest: MediaIngest,
        pipeline: MasteringPipeline,
        config: SchedulerConfig,
    ) -> Self {
        let workers = config.worker_concurrency.max(1);
        info!(
            "Job scheduler ready: {} workers, {:?} processing timeout",
            workers, config.processing_timeout
        );
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                files,
                ingest,
                pipeline,
                permits: Arc::new(Semaphore::new(workers)),
                tracker: TaskTracker::new(),
                config,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn files(&self) -> &FileHandler {
        &self.inner.files
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Jobs currently holding a worker slot.
    pub fn active_workers(&self) -> usize {
        self.inner
            .config
            .worker_concurrency
            .max(1)
            .saturating_sub(self.inner.permits.available_permits())
    }

    /// Registers a job and schedules it. Returns as soon as the job is
    /// visible as `queued`.
    pub fn submit(&self, request: MasteringRequest) -> Result<JobId, JobStoreError> {
        let reference = match request.method {
            MasteringMethod::Reference => request.reference,
            MasteringMethod::Parameter => None,
        };
        let job_id = self.inner.store.create(NewJob {
            input_ref: request.target,
            reference_ref: reference,
            method_requested: request.method,
            params: request.params.clamped(),
            export_format: request.export_format,
        })?;
        metrics::record_job_submitted();
        info!(
            "Job {} queued (method: {})",
            job_id,
            request.method.as_str()
        );

        let inner = self.inner.clone();
        let id = job_id.clone();
        self.inner.tracker.spawn(async move {
            inner.run_job(id).await;
        });

        Ok(job_id)
    }

    /// Stops starting new jobs and waits up to `grace` for running ones.
    /// Returns whether every job task finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!("Shutting down job scheduler...");
        self.inner.permits.close();
        self.inner.tracker.close();

        let drained = tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok();
        if drained {
            info!("Job scheduler shutdown complete");
        } else {
            warn!(
                "{} job task(s) still running after {:?}, abandoning them",
                self.inner.tracker.len(),
                grace
            );
        }
        drained
    }
}

impl SchedulerInner {
    async fn run_job(self: Arc<Self>, job_id: JobId) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Scheduler closed, job {} stays queued", job_id);
                return;
            }
        };

        let job = match self.store.update_status(&job_id, StatusUpdate::Processing) {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => {
                info!("Job {} expired before a worker picked it up", job_id);
                return;
            }
            Err(e) => {
                self.report_store_error(&job_id, e);
                return;
            }
        };
        metrics::record_job_started();
        info!("Job {} processing", job_id);
        let start = Instant::now();

        let output_path = self.files.output_path(&job.id, job.export_format);
        let mut worker = tokio::spawn(self.clone().process(job));
        let timeout = self.config.processing_timeout;

        let update = match tokio::time::timeout(timeout, &mut worker).await {
            Ok(Ok(Ok(outcome))) => StatusUpdate::Completed {
                output_ref: outcome.output,
                method_used: outcome.method_used,
                attempts: outcome.attempts,
            },
            Ok(Ok(Err(failure))) => StatusUpdate::Failed {
                error: failure.to_string(),
                attempts: failure.into_attempts(),
            },
            Ok(Err(join_error)) => {
                error!("Job {} processing task died: {}", job_id, join_error);
                StatusUpdate::Failed {
                    error: if join_error.is_panic() {
                        "processing task panicked".to_string()
                    } else {
                        "processing task was cancelled".to_string()
                    },
                    attempts: Vec::new(),
                }
            }
            Err(_) => {
                warn!("Job {} timed out after {:?}", job_id, timeout);
                // Abort lands at the worker's next await, which a blocking
                // engine call may never reach. Never wait for it here.
                worker.abort();
                self.clone().reap_abandoned(job_id.clone(), worker, output_path.clone());
                StatusUpdate::Failed {
                    error: format!("processing timed out after {}s", timeout.as_secs()),
                    attempts: Vec::new(),
                }
            }
        };

        // Intermediates and partial output go before the terminal status is
        // published, so a poller seeing it never sees them.
        let status = update.target_status();
        if let StatusUpdate::Failed { .. } = update {
            if let Err(e) = self.files.remove_output(&output_path).await {
                warn!("Job {}: failed to remove partial artifact: {}", job_id, e);
            }
        }
        if let Err(e) = self.files.cleanup_work_dir(&job_id).await {
            warn!("Job {}: failed to clean work directory: {}", job_id, e);
        }

        match self.publish_terminal(&job_id, update).await {
            Ok(job) => match (&job.method_used, &job.error) {
                (Some(method), _) => info!(
                    "Job {} completed with {} in {:?}",
                    job_id,
                    method,
                    start.elapsed()
                ),
                (None, error) => warn!(
                    "Job {} failed after {:?}: {}",
                    job_id,
                    start.elapsed(),
                    error.as_deref().unwrap_or_default()
                ),
            },
            Err(JobStoreError::NotFound(_)) => {
                warn!("Job {} disappeared while processing", job_id);
            }
            Err(e) => self.report_store_error(&job_id, e),
        }
        metrics::record_job_finished(status.as_str(), start.elapsed());
    }

    /// Writes the terminal status, retrying backend errors so a transient
    /// store failure cannot leave the job in `processing`.
    async fn publish_terminal(
        &self,
        job_id: &str,
        update: StatusUpdate,
    ) -> Result<Job, JobStoreError> {
        let mut backoff = TERMINAL_WRITE_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.store.update_status(job_id, update.clone()) {
                Err(JobStoreError::Backend(e)) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                    warn!(
                        "Job {}: terminal status write failed (attempt {}/{}): {}",
                        job_id, attempt, TERMINAL_WRITE_ATTEMPTS, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Waits for a timed-out worker off the job's path and removes whatever it
    /// wrote after the job was already failed.
    fn reap_abandoned(
        self: Arc<Self>,
        job_id: JobId,
        worker: JoinHandle<Result<MasteringOutcome, JobFailure>>,
        output_path: PathBuf,
    ) {
        tokio::spawn(async move {
            let _ = worker.await;
            debug!("Job {}: abandoned worker finished", job_id);
            if let Err(e) = self.files.remove_output(&output_path).await {
                warn!("Job {}: failed to remove late artifact: {}", job_id, e);
            }
            if let Err(e) = self.files.cleanup_work_dir(&job_id).await {
                warn!("Job {}: failed to clean work directory: {}", job_id, e);
            }
        });
    }

    /// Ingest followed by the pipeline. Runs in its own task.
    async fn process(self: Arc<Self>, job: Job) -> Result<MasteringOutcome, JobFailure> {
        let work_dir = self.files.create_work_dir(&job.id).await?;

        let target = self
            .ingest
            .ingest(&job.input_ref, UploadRole::Target, &work_dir)
            .await?;

        let reference = match (job.method_requested, &job.reference_ref) {
            (MasteringMethod::Reference, Some(file)) => {
                match self
                    .ingest
                    .ingest(file, UploadRole::Reference, &work_dir)
                    .await
                {
                    Ok(audio) => ReferenceInput::Ready(audio),
                    Err(e) => {
                        warn!("Job {}: reference track rejected: {}", job.id, e);
                        ReferenceInput::Rejected(e.to_string())
                    }
                }
            }
            _ => ReferenceInput::Missing,
        };

        let ctx = TierContext {
            job_id: &job.id,
            target: &target,
            reference: &reference,
            params: job.params,
            method_requested: job.method_requested,
            work_dir: &work_dir,
        };
        let output = self.files.output_path(&job.id, job.export_format);
        let outcome = self.pipeline.run(&ctx, job.export_format, &output).await?;
        Ok(outcome)
    }

    fn report_store_error(&self, job_id: &str, err: JobStoreError) {
        if self.config.strict_transitions {
            if let JobStoreError::InvalidTransition { .. } = err {
                panic!("Job {}: {}", job_id, err);
            }
        }
        error!("Job {}: {}", job_id, err);
    }
}
