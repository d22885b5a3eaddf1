use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Server settings (can override CLI)
    pub secret_key: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub debug: Option<bool>,
    pub logging_level: Option<String>,
    pub frontend_dir_path: Option<String>,

    // Storage
    pub storage_root: Option<String>,
    pub job_db: Option<String>,
    /// Human readable, e.g. "100 MiB".
    pub max_upload_size: Option<String>,
    pub max_reference_upload_size: Option<String>,

    // Feature configs
    pub retention: Option<RetentionConfig>,
    pub processing: Option<ProcessingConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    pub retention_minutes: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub stuck_queued_max_age_minutes: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ProcessingConfig {
    pub worker_concurrency: Option<usize>,
    pub processing_timeout_secs: Option<u64>,
    pub reference_matching: Option<bool>,
    pub ffmpeg_path: Option<String>,
    pub ffprobe_path: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections() {
        let config = FileConfig::parse(
            r#"
            port = 8080
            max_upload_size = "50 MiB"

            [retention]
            retention_minutes = 30

            [processing]
            worker_concurrency = 4
            reference_matching = false
            "#,
        )
        .unwrap();

        assert_eq!(config.port, Some(8080));
        assert_eq!(config.max_upload_size.as_deref(), Some("50 MiB"));
        assert_eq!(config.retention.unwrap().retention_minutes, Some(30));
        let processing = config.processing.unwrap();
        assert_eq!(processing.worker_concurrency, Some(4));
        assert_eq!(processing.reference_matching, Some(false));
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = FileConfig::parse("").unwrap();
        assert!(config.port.is_none());
        assert!(config.retention.is_none());
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(FileConfig::parse("port = \"not a number\"").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = FileConfig::load(Path::new("/nonexistent/mastering.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
