//! Mastering DSP backend.
//!
//! The engine is treated as a black box that may fail; the pipeline decides
//! what to do about failures.

use crate::ffmpeg::{ConversionError, Ffmpeg};
use crate::ingest::db_to_linear;
use crate::jobs::MasteringParams;
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// True-peak ceiling of mastered output, in dBTP.
pub const TRUE_PEAK_CEILING_DB: f32 = -1.0;

/// Sample rate of mastered intermediates. `loudnorm` upsamples internally.
pub const OUTPUT_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConversionError> for EngineError {
    fn from(err: ConversionError) -> Self {
        match err {
            ConversionError::Io(e) => EngineError::Io(e),
            other => EngineError::Processing(other.to_string()),
        }
    }
}

#[async_trait]
pub trait MasteringEngine: Send + Sync {
    /// Whether `master_by_reference` can be used at all.
    fn supports_reference_matching(&self) -> bool;

    async fn master_by_parameters(
        &self,
        input: &Path,
        params: &MasteringParams,
        output: &Path,
    ) -> Result<(), EngineError>;

    async fn master_by_reference(
        &self,
        target: &Path,
        reference: &Path,
        output: &Path,
    ) -> Result<(), EngineError>;
}

/// Low-shelf gain at 100 Hz, 0..+12 dB.
pub fn bass_gain_db(knob: f32) -> f32 {
    knob * 1.2
}

/// High-shelf gain at 8 kHz, 0..+8 dB.
pub fn treble_gain_db(knob: f32) -> f32 {
    knob * 0.8
}

/// Compressor threshold (dBFS) and ratio. Threshold falls from -10 to -25 dB
/// while the ratio rises from 1:1 to 6:1.
pub fn compressor_settings(knob: f32) -> (f32, f32) {
    (-10.0 - 1.5 * knob, 1.0 + 0.5 * knob)
}

/// `extrastereo` multiplier, 1.0 (unchanged) to 2.0.
pub fn stereo_multiplier(knob: f32) -> f32 {
    1.0 + 0.1 * knob
}

fn loudnorm_stage(target_lufs: f32) -> String {
    format!(
        "loudnorm=I={:.1}:TP={:.1}:LRA=11",
        target_lufs, TRUE_PEAK_CEILING_DB
    )
}

fn limiter_stage() -> String {
    format!(
        "alimiter=limit={:.4}:level=disabled",
        db_to_linear(TRUE_PEAK_CEILING_DB)
    )
}

/// Builds the `-af` chain for parameter mastering. A knob at zero leaves its
/// stage out entirely.
pub fn parameter_filter_chain(params: &MasteringParams) -> String {
    let params = params.clamped();
    let mut stages = Vec::new();

    if params.bass_boost > 0.0 {
        stages.push(format!("bass=g={:.2}:f=100", bass_gain_db(params.bass_boost)));
    }
    if params.brightness > 0.0 {
        stages.push(format!(
            "treble=g={:.2}:f=8000",
            treble_gain_db(params.brightness)
        ));
    }
    if params.compression > 0.0 {
        let (threshold_db, ratio) = compressor_settings(params.compression);
        stages.push(format!(
            "acompressor=threshold={:.5}:ratio={:.2}:attack=20:release=250",
            db_to_linear(threshold_db),
            ratio
        ));
    }
    if params.stereo_width > 0.0 {
        stages.push(format!(
            "extrastereo=m={:.2}",
            stereo_multiplier(params.stereo_width)
        ));
    }
    stages.push(loudnorm_stage(params.loudness_lufs));
    stages.push(limiter_stage());

    stages.join(",")
}

#[derive(Debug, Deserialize)]
struct LoudnormStats {
    input_i: String,
}

/// Extracts the integrated loudness from `loudnorm=print_format=json` output.
pub fn parse_measured_loudness(stderr: &str) -> Option<f32> {
    let start = stderr.rfind('{')?;
    let end = stderr[start..].find('}')? + start;
    let stats: LoudnormStats = serde_json::from_str(&stderr[start..=end]).ok()?;
    stats.input_i.trim().parse::<f32>().ok().filter(|v| v.is_finite())
}

/// `MasteringEngine` built from ffmpeg audio filters.
///
/// Reference matching measures the reference's integrated loudness and
/// normalizes the target to it.
#[derive(Debug, Clone)]
pub struct FfmpegMasteringEngine {
    ffmpeg: Ffmpeg,
    reference_matching: bool,
}

impl FfmpegMasteringEngine {
    pub fn new(ffmpeg: Ffmpeg, reference_matching: bool) -> Self {
        Self {
            ffmpeg,
            reference_matching,
        }
    }

    async fn render(&self, input: &Path, filter: String, output: &Path) -> Result<(), EngineError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let args: Vec<OsString> = vec![
            "-i".into(),
            input.into(),
            "-vn".into(),
            "-af".into(),
            filter.into(),
            "-ar".into(),
            OUTPUT_SAMPLE_RATE.to_string().into(),
            "-c:a".into(),
            "pcm_f32le".into(),
            output.into(),
        ];
        self.ffmpeg.run(args).await?;
        Ok(())
    }

    async fn measure_loudness(&self, path: &Path) -> Result<f32, EngineError> {
        let args: Vec<OsString> = vec![
            "-i".into(),
            path.into(),
            "-vn".into(),
            "-af".into(),
            "loudnorm=print_format=json".into(),
            "-f".into(),
            "null".into(),
            "-".into(),
        ];
        let stderr = self.ffmpeg.run(args).await?;
        parse_measured_loudness(&stderr).ok_or_else(|| {
            EngineError::Processing("could not measure reference loudness".to_string())
        })
    }
}

#[async_trait]
impl MasteringEngine for FfmpegMasteringEngine {
    fn supports_reference_matching(&self) -> bool {
        self.reference_matching
    }

    async fn master_by_parameters(
        &self,
        input: &Path,
        params: &MasteringParams,
        output: &Path,
    ) -> Result<(), EngineError> {
        let filter = parameter_filter_chain(params);
        debug!("Parameter mastering filter: {}", filter);
        self.render(input, filter, output).await
    }

    async fn master_by_reference(
        &self,
        target: &Path,
        reference: &Path,
        output: &Path,
    ) -> Result<(), EngineError> {
        if !self.reference_matching {
            return Err(EngineError::Unavailable(
                "reference matching is disabled".to_string(),
            ));
        }
        let measured = self.measure_loudness(reference).await?;
        let target_lufs =
            measured.clamp(MasteringParams::LOUDNESS_MIN, MasteringParams::LOUDNESS_MAX);
        debug!(
            "Reference loudness {:.1} LUFS, matching at {:.1} LUFS",
            measured, target_lufs
        );
        let filter = format!("{},{}", loudnorm_stage(target_lufs), limiter_stage());
        self.render(target, filter, output).await
    }
}
