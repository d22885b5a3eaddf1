//! Upload, polling and download endpoints.

use super::metrics::record_error;
use super::state::{GuardedJobStore, ServerState};
use super::status_page::{render_not_found, render_status_page};
use super::ServerConfig;
use crate::ingest::{sanitize_filename, FileHandlerError};
use crate::jobs::{
    ExportFormat, Job, JobId, JobStatus, JobStoreError, MasteringMethod, MasteringParams,
    MethodUsed, StoredFile, TierAttempt,
};
use crate::scheduler::{JobScheduler, MasteringRequest};
use axum::{
    body::{Body, Bytes},
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs::File;
use tokio::io::BufReader;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

const STREAM_CHUNK_SIZE: usize = 4096 * 16;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Serialize)]
struct UploadResponse {
    job_id: JobId,
    status: JobStatus,
    status_url: String,
}

/// JSON projection of a job served to pollers.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub method_requested: MasteringMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_used: Option<MethodUsed>,
    pub export_format: ExportFormat,
    pub attempts: Vec<TierAttempt>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        let download_url = match job.status {
            JobStatus::Completed => Some(format!("/download/{}", job.id)),
            _ => None,
        };
        Self {
            job_id: job.id,
            status: job.status,
            error: job.error,
            method_requested: job.method_requested,
            method_used: job.method_used,
            export_format: job.export_format,
            attempts: job.attempts,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            download_url,
        }
    }
}

struct UploadedFile {
    filename: String,
    data: Bytes,
}

/// Fields of the upload form. Unknown fields are ignored.
#[derive(Default)]
struct UploadForm {
    target: Option<UploadedFile>,
    reference: Option<UploadedFile>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, MultipartError> {
        let mut form = UploadForm::default();
        while let Some(field) = multipart.next_field().await? {
            let field_name = field.name().unwrap_or("").to_string();
            match field_name.as_str() {
                "target_file" | "reference_file" => {
                    let filename = field.file_name().map(|s| s.to_string());
                    let data = field.bytes().await?;
                    // Browsers send an empty part when no file was picked
                    let file = filename
                        .filter(|f| !f.is_empty())
                        .map(|filename| UploadedFile { filename, data });
                    if field_name == "target_file" {
                        form.target = file;
                    } else {
                        form.reference = file;
                    }
                }
                "" => {}
                _ => {
                    let value = field.text().await?;
                    form.fields.insert(field_name, value);
                }
            }
        }
        Ok(form)
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Unparseable numbers fall back to the control's default; out of range
    /// ones are clamped.
    fn number_or(&self, name: &str, default: f32) -> f32 {
        self.field(name)
            .and_then(|v| v.parse::<f32>().ok())
            .unwrap_or(default)
    }

    fn params(&self) -> MasteringParams {
        MasteringParams::new(
            self.number_or("bass_boost", MasteringParams::DEFAULT_KNOB),
            self.number_or("brightness", MasteringParams::DEFAULT_KNOB),
            self.number_or("compression", MasteringParams::DEFAULT_KNOB),
            self.number_or("stereo_width", MasteringParams::DEFAULT_KNOB),
            self.number_or("loudness", MasteringParams::DEFAULT_LOUDNESS),
        )
    }

    fn method(&self) -> Result<MasteringMethod, String> {
        self.field("mastering_method")
            .map(str::parse::<MasteringMethod>)
            .transpose()
            .map(Option::unwrap_or_default)
    }

    fn export_format(&self) -> Result<ExportFormat, String> {
        self.field("export_format")
            .map(str::parse::<ExportFormat>)
            .transpose()
            .map(Option::unwrap_or_default)
    }
}

async fn save_file(scheduler: &JobScheduler, file: &UploadedFile) -> Result<StoredFile, Response> {
    match scheduler.files().save_upload(&file.filename, &file.data).await {
        Ok(stored) => Ok(stored),
        Err(FileHandlerError::InvalidFilename(name)) => Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid filename: {}", name),
        )),
        Err(e) => {
            error!("Failed to store upload {}: {}", file.filename, e);
            record_error("storage", "upload");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to store upload",
            ))
        }
    }
}

async fn discard_uploads(scheduler: &JobScheduler, files: &[&StoredFile]) {
    for file in files {
        if let Err(e) = scheduler.files().remove_upload(file).await {
            warn!("Failed to remove upload {:?}: {}", file.path, e);
        }
    }
}

/// POST /upload - Store the uploaded track(s) and queue a mastering job
async fn upload(State(scheduler): State<JobScheduler>, multipart: Multipart) -> Response {
    let form = match UploadForm::read(multipart).await {
        Ok(form) => form,
        Err(e) => {
            warn!("Failed to read upload form: {}", e);
            return error_response(e.status(), e.body_text());
        }
    };

    let target = match &form.target {
        Some(target) => target,
        None => return error_response(StatusCode::BAD_REQUEST, "No target file uploaded"),
    };
    let method = match form.method() {
        Ok(method) => method,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let export_format = match form.export_format() {
        Ok(format) => format,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let params = form.params();

    debug!(
        "Upload: target {} ({} bytes), method {}, export {}",
        target.filename,
        target.data.len(),
        method.as_str(),
        export_format.extension()
    );

    let target = match save_file(&scheduler, target).await {
        Ok(stored) => stored,
        Err(response) => return response,
    };

    // A reference only matters for reference mastering
    let reference = match (&form.reference, method) {
        (Some(reference), MasteringMethod::Reference) => {
            match save_file(&scheduler, reference).await {
                Ok(stored) => Some(stored),
                Err(response) => {
                    discard_uploads(&scheduler, &[&target]).await;
                    return response;
                }
            }
        }
        _ => None,
    };

    let request = MasteringRequest {
        target: target.clone(),
        reference: reference.clone(),
        method,
        params,
        export_format,
    };
    match scheduler.submit(request) {
        Ok(job_id) => {
            info!("Accepted upload {} as job {}", target.original_name, job_id);
            let status_url = format!("/status/{}", job_id);
            (
                StatusCode::ACCEPTED,
                Json(UploadResponse {
                    job_id,
                    status: JobStatus::Queued,
                    status_url,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to create job: {}", e);
            record_error("store", "upload");
            let mut stored = vec![&target];
            stored.extend(reference.as_ref());
            discard_uploads(&scheduler, &stored).await;
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create job")
        }
    }
}

fn store_error_response(id: &str, e: JobStoreError, endpoint: &str) -> Response {
    match e {
        JobStoreError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "Job not found"),
        e => {
            error!("Failed to load job {}: {}", id, e);
            record_error("store", endpoint);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load job")
        }
    }
}

/// GET /api/status/{id} - JSON status for client side polling
async fn api_status(State(store): State<GuardedJobStore>, Path(id): Path<String>) -> Response {
    match store.get(&id) {
        Ok(job) => Json(JobStatusResponse::from(job)).into_response(),
        Err(e) => store_error_response(&id, e, "api_status"),
    }
}

/// GET /status/{id} - Human readable status page
async fn status_page(State(store): State<GuardedJobStore>, Path(id): Path<String>) -> Response {
    match store.get(&id) {
        Ok(job) => Html(render_status_page(&job)).into_response(),
        Err(JobStoreError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, Html(render_not_found(&id))).into_response()
        }
        Err(e) => store_error_response(&id, e, "status"),
    }
}

/// `mastered_<original stem>.<ext>`, restricted to header-safe characters.
fn download_filename(job: &Job) -> String {
    let stem = sanitize_filename(&job.input_ref.original_name)
        .ok()
        .and_then(|name| {
            std::path::Path::new(&name)
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "track".to_string());
    let stem: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("mastered_{}.{}", stem, job.export_format.extension())
}

/// GET /download/{id} - Stream the mastered artifact
async fn download(State(store): State<GuardedJobStore>, Path(id): Path<String>) -> Response {
    let job = match store.get(&id) {
        Ok(job) => job,
        Err(e) => return store_error_response(&id, e, "download"),
    };

    let output = match (&job.status, &job.output_ref) {
        (JobStatus::Completed, Some(output)) => output.clone(),
        _ => {
            debug!("Download of job {} requested while {}", id, job.status);
            return error_response(StatusCode::NOT_FOUND, "Job not completed");
        }
    };

    let file = match File::open(&output).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return error_response(StatusCode::NOT_FOUND, "Mastered file has expired");
        }
        Err(e) => {
            error!("Failed to open artifact {:?}: {}", output, e);
            record_error("io", "download");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file");
        }
    };
    let file_length = match file.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            error!("Failed to stat artifact {:?}: {}", output, e);
            record_error("io", "download");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file");
        }
    };

    debug!("Streaming job {} artifact from {:?}", id, output);
    let file_reader = BufReader::with_capacity(STREAM_CHUNK_SIZE, file);
    let stream = ReaderStream::with_capacity(file_reader, STREAM_CHUNK_SIZE);

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                job.export_format.content_type().to_string(),
            ),
            (header::CONTENT_LENGTH, file_length.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download_filename(&job)),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Routes:
/// - POST /upload - Multipart form, returns `{job_id}`
/// - GET /status/{id} - HTML status page
/// - GET /api/status/{id} - JSON status
/// - GET /download/{id} - Mastered file
pub fn mastering_routes(config: &ServerConfig) -> Router<ServerState> {
    let upload_route = Router::new()
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::max(config.upload_body_limit()));

    Router::new()
        .merge(upload_route)
        .route("/status/{id}", get(status_page))
        .route("/api/status/{id}", get(api_status))
        .route("/download/{id}", get(download))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{NewJob, StoredFile};
    use std::path::PathBuf;

    fn form(fields: &[(&str, &str)]) -> UploadForm {
        UploadForm {
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn job_with_name(name: &str, format: ExportFormat) -> Job {
        Job::new(
            "job",
            NewJob {
                input_ref: StoredFile {
                    path: PathBuf::from("/storage/uploads/u/x"),
                    original_name: name.to_string(),
                    size_bytes: 1,
                },
                reference_ref: None,
                method_requested: MasteringMethod::Parameter,
                params: MasteringParams::default(),
                export_format: format,
            },
            Utc::now(),
        )
    }

    #[test]
    fn form_params_default_and_clamp() {
        let params = form(&[
            ("bass_boost", "8"),
            ("brightness", "not a number"),
            ("compression", "42"),
            ("loudness", "-30"),
        ])
        .params();

        assert_eq!(params.bass_boost, 8.0);
        assert_eq!(params.brightness, MasteringParams::DEFAULT_KNOB);
        assert_eq!(params.compression, MasteringParams::KNOB_MAX);
        assert_eq!(params.stereo_width, MasteringParams::DEFAULT_KNOB);
        assert_eq!(params.loudness_lufs, MasteringParams::LOUDNESS_MIN);
    }

    #[test]
    fn form_method_and_format() {
        let empty = form(&[]);
        assert_eq!(empty.method(), Ok(MasteringMethod::Parameter));
        assert_eq!(empty.export_format(), Ok(ExportFormat::Wav));

        let set = form(&[("mastering_method", "Reference"), ("export_format", "mp3")]);
        assert_eq!(set.method(), Ok(MasteringMethod::Reference));
        assert_eq!(set.export_format(), Ok(ExportFormat::Mp3));

        let bad = form(&[("mastering_method", "magic"), ("export_format", "flac")]);
        assert!(bad.method().is_err());
        assert!(bad.export_format().is_err());
    }

    #[test]
    fn download_filename_uses_original_stem() {
        assert_eq!(
            download_filename(&job_with_name("song.wav", ExportFormat::Wav)),
            "mastered_song.wav"
        );
        assert_eq!(
            download_filename(&job_with_name("My Song.flac", ExportFormat::Mp3)),
            "mastered_My Song.mp3"
        );
        assert_eq!(
            download_filename(&job_with_name("C:\\mixes\\caf\u{e9}\".wav", ExportFormat::Wav)),
            "mastered_caf__.wav"
        );
        assert_eq!(
            download_filename(&job_with_name("..", ExportFormat::Wav)),
            "mastered_track.wav"
        );
    }

    #[test]
    fn status_response_links_download_only_when_completed() {
        let job = job_with_name("song.wav", ExportFormat::Wav);
        let response = JobStatusResponse::from(job);
        assert_eq!(response.status, JobStatus::Queued);
        assert!(response.download_url.is_none());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "queued");
        assert!(json.get("error").is_none());
        assert!(json.get("method_used").is_none());
    }
}
