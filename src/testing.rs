//! In-process stand-ins for the ffmpeg-backed converter and engine.
//!
//! They copy bytes around instead of processing audio, so the job lifecycle
//! can be exercised without external binaries.

use crate::ffmpeg::{AudioMetadata, ConversionError};
use crate::ingest::AudioConverter;
use crate::jobs::{ExportFormat, MasteringParams};
use crate::mastering::{EngineError, MasteringEngine};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Converter that treats every file as audio unless it starts with
/// `CORRUPT_MARKER`.
#[derive(Debug, Default)]
pub struct FakeConverter {
    pub fail_passthrough: bool,
    pub fail_encode: bool,
}

impl FakeConverter {
    pub const CORRUPT_MARKER: &'static [u8] = b"CORRUPT";
}

async fn copy(input: &Path, output: &Path) -> Result<(), ConversionError> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(input, output).await?;
    Ok(())
}

#[async_trait]
impl AudioConverter for FakeConverter {
    async fn probe(&self, path: &Path) -> Result<AudioMetadata, ConversionError> {
        let data = tokio::fs::read(path).await?;
        if data.starts_with(Self::CORRUPT_MARKER) {
            return Err(ConversionError::ProbeFailed(
                "Invalid data found when processing input".to_string(),
            ));
        }
        Ok(AudioMetadata {
            duration_ms: data.len() as i64,
            codec: "pcm_s16le".to_string(),
            bitrate: Some(1411),
            sample_rate: Some(44100),
            channels: Some(2),
            format: "wav".to_string(),
        })
    }

    async fn decode_to_wav(&self, input: &Path, output: &Path) -> Result<(), ConversionError> {
        copy(input, output).await
    }

    async fn passthrough(&self, input: &Path, output: &Path) -> Result<(), ConversionError> {
        if self.fail_passthrough {
            return Err(ConversionError::ConversionFailed(
                "passthrough disabled".to_string(),
            ));
        }
        copy(input, output).await
    }

    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        _format: ExportFormat,
    ) -> Result<(), ConversionError> {
        if self.fail_encode {
            return Err(ConversionError::ConversionFailed(
                "encoder unavailable".to_string(),
            ));
        }
        copy(input, output).await
    }
}

/// Engine that prefixes its input with the name of the method used.
///
/// Reduced parameter calls (every tonal knob at zero) are told apart from
/// full ones so each tier can be failed on its own.
#[derive(Debug)]
pub struct FakeEngine {
    pub reference_matching: bool,
    pub fail_reference: bool,
    pub fail_parameter: bool,
    pub fail_reduced: bool,
    /// Never return from any call.
    pub hang: bool,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            reference_matching: true,
            fail_reference: false,
            fail_parameter: false,
            fail_reduced: false,
            hang: false,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeEngine {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn render(&self, label: &str, input: &Path, output: &Path) -> Result<(), EngineError> {
        let mut data = format!("{}:", label).into_bytes();
        data.extend(tokio::fs::read(input).await?);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, data).await?;
        Ok(())
    }

    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_reduced(params: &MasteringParams) -> bool {
    params.bass_boost == 0.0
        && params.brightness == 0.0
        && params.compression == 0.0
        && params.stereo_width == 0.0
}

#[async_trait]
impl MasteringEngine for FakeEngine {
    fn supports_reference_matching(&self) -> bool {
        self.reference_matching
    }

    async fn master_by_parameters(
        &self,
        input: &Path,
        params: &MasteringParams,
        output: &Path,
    ) -> Result<(), EngineError> {
        self.enter().await;
        let (label, fail) = if is_reduced(params) {
            ("reduced_parameter", self.fail_reduced)
        } else {
            ("parameter", self.fail_parameter)
        };
        if fail {
            return Err(EngineError::Processing(format!("{} mastering crashed", label)));
        }
        self.render(label, input, output).await
    }

    async fn master_by_reference(
        &self,
        target: &Path,
        _reference: &Path,
        output: &Path,
    ) -> Result<(), EngineError> {
        self.enter().await;
        if !self.reference_matching {
            return Err(EngineError::Unavailable("reference matching".to_string()));
        }
        if self.fail_reference {
            return Err(EngineError::Processing(
                "reference matching crashed".to_string(),
            ));
        }
        self.render("reference", target, output).await
    }
}
