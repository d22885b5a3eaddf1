//! Audio decoding and encoding.

use crate::ffmpeg::{AudioMetadata, ConversionError, Ffmpeg};
use crate::jobs::ExportFormat;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;

/// Peak ceiling applied by the pass-through re-encode, in dBFS.
pub const PASSTHROUGH_CEILING_DB: f32 = -1.0;

/// Bitrate of MP3 exports, in kbps.
pub const MP3_BITRATE_KBPS: u32 = 320;

/// Format conversion backend used by ingest, the pass-through tier and export.
#[async_trait]
pub trait AudioConverter: Send + Sync {
    /// Reads stream metadata. Fails for anything that does not decode as audio.
    async fn probe(&self, path: &Path) -> Result<AudioMetadata, ConversionError>;

    /// Decodes `input` into the internal intermediate (32-bit float WAV).
    async fn decode_to_wav(&self, input: &Path, output: &Path) -> Result<(), ConversionError>;

    /// Re-encodes `input` unchanged except for a peak limiter at
    /// `PASSTHROUGH_CEILING_DB`.
    async fn passthrough(&self, input: &Path, output: &Path) -> Result<(), ConversionError>;

    /// Encodes an intermediate into the downloadable container.
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        format: ExportFormat,
    ) -> Result<(), ConversionError>;
}

/// `AudioConverter` backed by the ffmpeg executables.
#[derive(Debug, Clone, Default)]
pub struct FfmpegConverter {
    ffmpeg: Ffmpeg,
}

impl FfmpegConverter {
    pub fn new(ffmpeg: Ffmpeg) -> Self {
        Self { ffmpeg }
    }
}

/// Linear amplitude for a dBFS value, as `alimiter` expects it.
pub(crate) fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

pub(crate) fn export_codec_args(format: ExportFormat) -> Vec<String> {
    match format {
        ExportFormat::Wav => vec!["-c:a".into(), "pcm_s24le".into()],
        ExportFormat::Mp3 => vec![
            "-c:a".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            format!("{}k", MP3_BITRATE_KBPS),
        ],
    }
}

async fn ensure_parent(path: &Path) -> Result<(), ConversionError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[async_trait]
impl AudioConverter for FfmpegConverter {
    async fn probe(&self, path: &Path) -> Result<AudioMetadata, ConversionError> {
        self.ffmpeg.probe(path).await
    }

    async fn decode_to_wav(&self, input: &Path, output: &Path) -> Result<(), ConversionError> {
        ensure_parent(output).await?;
        let args: Vec<OsString> = vec![
            "-i".into(),
            input.into(),
            "-vn".into(),
            "-c:a".into(),
            "pcm_f32le".into(),
            output.into(),
        ];
        self.ffmpeg.run(args).await?;
        Ok(())
    }

    async fn passthrough(&self, input: &Path, output: &Path) -> Result<(), ConversionError> {
        ensure_parent(output).await?;
        let filter = format!(
            "alimiter=limit={:.4}:level=disabled",
            db_to_linear(PASSTHROUGH_CEILING_DB)
        );
        let args: Vec<OsString> = vec![
            "-i".into(),
            input.into(),
            "-vn".into(),
            "-af".into(),
            filter.into(),
            "-c:a".into(),
            "pcm_f32le".into(),
            output.into(),
        ];
        self.ffmpeg.run(args).await?;
        Ok(())
    }

    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        format: ExportFormat,
    ) -> Result<(), ConversionError> {
        ensure_parent(output).await?;
        let mut args: Vec<OsString> = vec!["-i".into(), input.into(), "-vn".into()];
        args.extend(export_codec_args(format).into_iter().map(Into::into));
        args.push(output.into());
        self.ffmpeg.run(args).await?;
        Ok(())
    }
}
