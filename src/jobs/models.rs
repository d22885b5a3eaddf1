//! Data model for mastering jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

pub type JobId = String;

/// Lifecycle status of a mastering job.
///
/// Transitions only move forward: `Queued -> Processing -> Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Mastering method chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasteringMethod {
    #[default]
    Parameter,
    Reference,
}

impl MasteringMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasteringMethod::Parameter => "parameter",
            MasteringMethod::Reference => "reference",
        }
    }
}

impl FromStr for MasteringMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "parameter" => Ok(MasteringMethod::Parameter),
            "reference" => Ok(MasteringMethod::Reference),
            other => Err(format!("unknown mastering method: {}", other)),
        }
    }
}

/// Strategy tier that actually produced the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodUsed {
    Reference,
    Parameter,
    ReducedParameter,
    Passthrough,
}

impl MethodUsed {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodUsed::Reference => "reference",
            MethodUsed::Parameter => "parameter",
            MethodUsed::ReducedParameter => "reduced_parameter",
            MethodUsed::Passthrough => "passthrough",
        }
    }
}

impl std::fmt::Display for MethodUsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MethodUsed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reference" => Ok(MethodUsed::Reference),
            "parameter" => Ok(MethodUsed::Parameter),
            "reduced_parameter" => Ok(MethodUsed::ReducedParameter),
            "passthrough" => Ok(MethodUsed::Passthrough),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// Container format of the downloadable artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Wav,
    Mp3,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Wav => "wav",
            ExportFormat::Mp3 => "mp3",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Wav => "audio/wav",
            ExportFormat::Mp3 => "audio/mpeg",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wav" => Ok(ExportFormat::Wav),
            "mp3" => Ok(ExportFormat::Mp3),
            other => Err(format!("unknown export format: {}", other)),
        }
    }
}

/// Validated mastering controls.
///
/// The four tonal knobs are unitless intensities in `0..=10`; the loudness
/// target is expressed in LUFS and lives in `-20..=-6`. Every constructor
/// clamps, so a `MasteringParams` value is always in range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MasteringParams {
    pub bass_boost: f32,
    pub brightness: f32,
    pub compression: f32,
    pub stereo_width: f32,
    pub loudness_lufs: f32,
}

impl MasteringParams {
    pub const KNOB_MIN: f32 = 0.0;
    pub const KNOB_MAX: f32 = 10.0;
    pub const LOUDNESS_MIN: f32 = -20.0;
    pub const LOUDNESS_MAX: f32 = -6.0;
    pub const DEFAULT_KNOB: f32 = 5.0;
    pub const DEFAULT_LOUDNESS: f32 = -14.0;

    pub fn new(
        bass_boost: f32,
        brightness: f32,
        compression: f32,
        stereo_width: f32,
        loudness_lufs: f32,
    ) -> Self {
        Self {
            bass_boost,
            brightness,
            compression,
            stereo_width,
            loudness_lufs,
        }
        .clamped()
    }

    /// Returns a copy with every control forced into its range.
    /// Non-finite values fall back to the control's default.
    pub fn clamped(self) -> Self {
        Self {
            bass_boost: clamp_or(
                self.bass_boost,
                Self::KNOB_MIN,
                Self::KNOB_MAX,
                Self::DEFAULT_KNOB,
            ),
            brightness: clamp_or(
                self.brightness,
                Self::KNOB_MIN,
                Self::KNOB_MAX,
                Self::DEFAULT_KNOB,
            ),
            compression: clamp_or(
                self.compression,
                Self::KNOB_MIN,
                Self::KNOB_MAX,
                Self::DEFAULT_KNOB,
            ),
            stereo_width: clamp_or(
                self.stereo_width,
                Self::KNOB_MIN,
                Self::KNOB_MAX,
                Self::DEFAULT_KNOB,
            ),
            loudness_lufs: clamp_or(
                self.loudness_lufs,
                Self::LOUDNESS_MIN,
                Self::LOUDNESS_MAX,
                Self::DEFAULT_LOUDNESS,
            ),
        }
    }

    /// Conservative subset: loudness normalization only, every tonal knob off.
    pub fn reduced(&self) -> Self {
        Self {
            bass_boost: 0.0,
            brightness: 0.0,
            compression: 0.0,
            stereo_width: 0.0,
            loudness_lufs: self.loudness_lufs,
        }
    }
}

impl Default for MasteringParams {
    fn default() -> Self {
        Self {
            bass_boost: Self::DEFAULT_KNOB,
            brightness: Self::DEFAULT_KNOB,
            compression: Self::DEFAULT_KNOB,
            stereo_width: Self::DEFAULT_KNOB,
            loudness_lufs: Self::DEFAULT_LOUDNESS,
        }
    }
}

fn clamp_or(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

/// Handle to a file persisted under the storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub path: PathBuf,
    /// Filename as supplied by the client (before sanitization).
    pub original_name: String,
    pub size_bytes: u64,
}

/// Outcome of a single pipeline tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAttempt {
    pub tier: MethodUsed,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Everything needed to register a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub input_ref: StoredFile,
    pub reference_ref: Option<StoredFile>,
    pub method_requested: MasteringMethod,
    pub params: MasteringParams,
    pub export_format: ExportFormat,
}

/// One mastering request and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once, when the job enters `Completed` or `Failed`.
    pub completed_at: Option<DateTime<Utc>>,
    pub input_ref: StoredFile,
    pub reference_ref: Option<StoredFile>,
    /// Present iff `status == Completed`.
    pub output_ref: Option<PathBuf>,
    pub method_requested: MasteringMethod,
    pub method_used: Option<MethodUsed>,
    pub params: MasteringParams,
    /// Present iff `status == Failed`.
    pub error: Option<String>,
    pub export_format: ExportFormat,
    pub attempts: Vec<TierAttempt>,
}

impl Job {
    pub fn new(id: impl Into<JobId>, new_job: NewJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            created_at,
            started_at: None,
            completed_at: None,
            input_ref: new_job.input_ref,
            reference_ref: new_job.reference_ref,
            output_ref: None,
            method_requested: new_job.method_requested,
            method_used: None,
            params: new_job.params,
            error: None,
            export_format: new_job.export_format,
            attempts: Vec::new(),
        }
    }
}

/// A status change plus the data that must accompany it.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Processing,
    Completed {
        output_ref: PathBuf,
        method_used: MethodUsed,
        attempts: Vec<TierAttempt>,
    },
    Failed {
        error: String,
        attempts: Vec<TierAttempt>,
    },
}

impl StatusUpdate {
    pub fn target_status(&self) -> JobStatus {
        match self {
            StatusUpdate::Processing => JobStatus::Processing,
            StatusUpdate::Completed { .. } => JobStatus::Completed,
            StatusUpdate::Failed { .. } => JobStatus::Failed,
        }
    }

    /// Applies the update to `job`. The caller checks the transition first.
    pub(crate) fn apply(self, job: &mut Job, now: DateTime<Utc>) {
        match self {
            StatusUpdate::Processing => {
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
            }
            StatusUpdate::Completed {
                output_ref,
                method_used,
                attempts,
            } => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.output_ref = Some(output_ref);
                job.method_used = Some(method_used);
                job.attempts = attempts;
            }
            StatusUpdate::Failed { error, attempts } => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error = Some(if error.trim().is_empty() {
                    "processing failed".to_string()
                } else {
                    error
                });
                job.attempts = attempts;
            }
        }
    }
}
