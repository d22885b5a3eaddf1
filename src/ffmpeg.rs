//! Thin async wrapper around the `ffmpeg` and `ffprobe` executables.
//!
//! Child processes are spawned with `kill_on_drop`, so aborting the task that
//! awaits them also stops the external process.

use serde::Deserialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors that can occur while running ffmpeg/ffprobe.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    #[error("ffmpeg failed: {0}")]
    ConversionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),
}

/// Audio metadata extracted from ffprobe.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioMetadata {
    /// Duration in milliseconds.
    pub duration_ms: i64,
    /// Audio codec name.
    pub codec: String,
    /// Bitrate in kbps.
    pub bitrate: Option<i32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    /// Container format name (e.g., "wav", "mp3", "mov,mp4,m4a,3gp,3g2,mj2").
    pub format: String,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: String,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
    bit_rate: Option<String>,
}

/// Parses `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_output(json: &str) -> Result<AudioMetadata, ConversionError> {
    let probe: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| ConversionError::InvalidOutput(format!("JSON parse error: {}", e)))?;

    let audio_stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "audio")
        .ok_or_else(|| ConversionError::InvalidOutput("No audio stream found".to_string()))?;

    // Duration is reported in seconds
    let duration_secs: f64 = probe
        .format
        .duration
        .as_ref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0.0);

    // Prefer stream bitrate, fall back to format bitrate
    let bitrate = audio_stream
        .bit_rate
        .as_ref()
        .or(probe.format.bit_rate.as_ref())
        .and_then(|b| b.parse::<i64>().ok())
        .map(|b| (b / 1000) as i32);

    Ok(AudioMetadata {
        duration_ms: (duration_secs * 1000.0) as i64,
        codec: audio_stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        bitrate,
        sample_rate: audio_stream
            .sample_rate
            .as_ref()
            .and_then(|sr| sr.parse().ok()),
        channels: audio_stream.channels,
        format: probe.format.format_name,
    })
}

/// Locations of the ffmpeg binaries.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl Ffmpeg {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    /// Probe an audio file to extract metadata.
    pub async fn probe(&self, path: &Path) -> Result<AudioMetadata, ConversionError> {
        let output = Command::new(&self.ffprobe_bin)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConversionError::ProbeFailed(
                last_lines(&stderr, 5).unwrap_or_else(|| format!("exit status {}", output.status)),
            ));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Runs ffmpeg with `args`, returning its stderr on success.
    ///
    /// ffmpeg writes its diagnostics (and analysis filter reports such as
    /// `loudnorm`'s JSON) to stderr.
    pub async fn run<I, S>(&self, args: I) -> Result<String, ConversionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.ffmpeg_bin);
        command
            .args(["-hide_banner", "-nostdin", "-y"])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("Running {:?}", command.as_std());

        let output = command.output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(ConversionError::ConversionFailed(
                last_lines(&stderr, 5).unwrap_or_else(|| format!("exit status {}", output.status)),
            ));
        }
        Ok(stderr)
    }

    /// Check if ffmpeg and ffprobe are available.
    pub async fn check_available(&self) -> Result<(), ConversionError> {
        let ffprobe_ok = Command::new(&self.ffprobe_bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if !ffprobe_ok {
            return Err(ConversionError::ProbeFailed(format!(
                "{} not found or not working",
                self.ffprobe_bin.display()
            )));
        }

        let ffmpeg_ok = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if !ffmpeg_ok {
            return Err(ConversionError::ConversionFailed(format!(
                "{} not found or not working",
                self.ffmpeg_bin.display()
            )));
        }

        Ok(())
    }
}

/// The tail of a tool's stderr, which is where ffmpeg puts the actual error.
fn last_lines(text: &str, n: usize) -> Option<String> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(n);
    Some(lines[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "mjpeg"},
            {"codec_type": "audio", "codec_name": "mp3", "sample_rate": "44100",
             "channels": 2, "bit_rate": "320000"}
        ],
        "format": {"format_name": "mp3", "duration": "183.472000", "bit_rate": "321000"}
    }"#;

    #[test]
    fn test_parse_probe_output_picks_audio_stream() {
        let metadata = parse_probe_output(PROBE_JSON).unwrap();
        assert_eq!(metadata.codec, "mp3");
        assert_eq!(metadata.duration_ms, 183472);
        assert_eq!(metadata.bitrate, Some(320));
        assert_eq!(metadata.sample_rate, Some(44100));
        assert_eq!(metadata.channels, Some(2));
        assert_eq!(metadata.format, "mp3");
    }

    #[test]
    fn test_parse_probe_output_without_audio_stream() {
        let json =
            r#"{"streams": [{"codec_type": "video"}], "format": {"format_name": "png_pipe"}}"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(ConversionError::InvalidOutput(_))
        ));
        assert!(parse_probe_output("not json").is_err());
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\n\nb\nc\n", 2).as_deref(), Some("b\nc"));
        assert_eq!(last_lines("  \n", 2), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_io_error() {
        let ffmpeg = Ffmpeg::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        assert!(matches!(
            ffmpeg.run(["-version"]).await,
            Err(ConversionError::Io(_))
        ));
        assert!(ffmpeg.check_available().await.is_err());
    }
}
