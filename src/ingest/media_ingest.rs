//! Upload validation and normalization.
//!
//! Turns a stored upload into a WAV intermediate inside the job's work
//! directory. The upload itself is never modified.

use super::converter::AudioConverter;
use crate::ffmpeg::{AudioMetadata, ConversionError};
use crate::jobs::StoredFile;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Extensions accepted for upload.
pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["wav", "mp3", "aiff", "aif", "flac", "m4a", "ogg", "aac"];

/// Bytes read from the head of a file for content sniffing.
const SNIFF_LEN: usize = 8192;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("file is empty")]
    EmptyFile,

    #[error("unsupported file type: {0}")]
    UnsupportedFormat(String),

    #[error("file too large: {size} bytes (max: {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("unsupported or corrupt file: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which upload slot a file came from. Each has its own size ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRole {
    Target,
    Reference,
}

impl UploadRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadRole::Target => "target",
            UploadRole::Reference => "reference",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestLimits {
    pub max_target_bytes: u64,
    pub max_reference_bytes: u64,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_target_bytes: 100 * 1024 * 1024,
            max_reference_bytes: 200 * 1024 * 1024,
        }
    }
}

impl IngestLimits {
    pub fn max_for(&self, role: UploadRole) -> u64 {
        match role {
            UploadRole::Target => self.max_target_bytes,
            UploadRole::Reference => self.max_reference_bytes,
        }
    }
}

/// Decodable WAV intermediate derived from an upload.
#[derive(Debug, Clone)]
pub struct NormalizedAudio {
    pub path: PathBuf,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub duration_ms: i64,
    /// Container format the upload was decoded from.
    pub source_format: String,
}

pub struct MediaIngest {
    converter: Arc<dyn AudioConverter>,
    limits: IngestLimits,
}

impl MediaIngest {
    pub fn new(converter: Arc<dyn AudioConverter>, limits: IngestLimits) -> Self {
        Self { converter, limits }
    }

    pub fn limits(&self) -> IngestLimits {
        self.limits
    }

    /// Validates `file` and writes `<work_dir>/<role>.wav`.
    pub async fn ingest(
        &self,
        file: &StoredFile,
        role: UploadRole,
        work_dir: &Path,
    ) -> Result<NormalizedAudio, IngestError> {
        let size = tokio::fs::metadata(&file.path).await?.len();
        if size == 0 {
            return Err(IngestError::EmptyFile);
        }
        let max = self.limits.max_for(role);
        if size > max {
            return Err(IngestError::TooLarge { size, max });
        }

        if !is_supported_extension(&file.original_name) {
            return Err(IngestError::UnsupportedFormat(file.original_name.clone()));
        }

        let head = read_head(&file.path).await?;
        check_sniffed_type(&head)?;

        let metadata = self
            .converter
            .probe(&file.path)
            .await
            .map_err(corrupt)?;
        debug!(
            "Probed {} upload {:?}: format={}, codec={}, {} ms",
            role.as_str(),
            file.original_name,
            metadata.format,
            metadata.codec,
            metadata.duration_ms
        );

        let output = work_dir.join(format!("{}.wav", role.as_str()));
        self.converter
            .decode_to_wav(&file.path, &output)
            .await
            .map_err(corrupt)?;

        Ok(normalized(output, metadata))
    }
}

fn normalized(path: PathBuf, metadata: AudioMetadata) -> NormalizedAudio {
    NormalizedAudio {
        path,
        sample_rate: metadata.sample_rate,
        channels: metadata.channels,
        duration_ms: metadata.duration_ms,
        source_format: metadata.format,
    }
}

fn corrupt(err: ConversionError) -> IngestError {
    match err {
        ConversionError::Io(e) => IngestError::Io(e),
        other => IngestError::Corrupt(other.to_string()),
    }
}

pub fn is_supported_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

async fn read_head(path: &Path) -> Result<Vec<u8>, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Rejects content recognizably neither audio nor video, whatever its name.
/// Unrecognized content is left for the decoder to judge.
fn check_sniffed_type(head: &[u8]) -> Result<(), IngestError> {
    match infer::get(head) {
        Some(kind)
            if !matches!(
                kind.matcher_type(),
                infer::MatcherType::Audio | infer::MatcherType::Video
            ) =>
        {
            Err(IngestError::UnsupportedFormat(format!(
                "content looks like {}",
                kind.mime_type()
            )))
        }
        _ => Ok(()),
    }
}
