mod file_config;

pub use file_config::{FileConfig, ProcessingConfig, RetentionConfig};

use crate::ingest::IngestLimits;
use crate::jobs::RetentionPolicy;
use crate::scheduler::SchedulerConfig;
use crate::server::RequestsLoggingLevel;
use anyhow::{anyhow, bail, Result};
use byte_unit::Byte;
use clap::ValueEnum;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MAX_UPLOAD_SIZE: &str = "100 MiB";
pub const DEFAULT_MAX_REFERENCE_UPLOAD_SIZE: &str = "200 MiB";

/// Secret used when running in debug mode without one configured.
const DEBUG_SECRET_KEY: &str = "dev-secret-key";
const GENERATED_SECRET_KEY_LEN: usize = 48;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub secret_key: Option<String>,
    pub port: u16,
    pub metrics_port: u16,
    pub debug: bool,
    pub logging_level: RequestsLoggingLevel,
    pub frontend_dir_path: Option<String>,
    pub storage_root: PathBuf,
    pub job_db: Option<PathBuf>,
    pub max_upload_size: String,
    pub max_reference_upload_size: String,
    pub retention_minutes: u64,
    pub sweep_interval_secs: u64,
    pub stuck_queued_max_age_minutes: u64,
    pub worker_concurrency: usize,
    pub processing_timeout_secs: u64,
    pub reference_matching: bool,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            port: 5000,
            metrics_port: 9091,
            debug: false,
            logging_level: RequestsLoggingLevel::Path,
            frontend_dir_path: None,
            storage_root: PathBuf::from("storage"),
            job_db: None,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE.to_string(),
            max_reference_upload_size: DEFAULT_MAX_REFERENCE_UPLOAD_SIZE.to_string(),
            retention_minutes: 60,
            sweep_interval_secs: 300,
            stuck_queued_max_age_minutes: 120,
            worker_concurrency: 2,
            processing_timeout_secs: 600,
            reference_matching: true,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Server settings
    /// Reserved for signing client-facing tokens. Nothing reads it yet; it is
    /// resolved so deployments can set it ahead of time.
    pub secret_key: String,
    pub port: u16,
    pub metrics_port: u16,
    pub debug: bool,
    pub logging_level: RequestsLoggingLevel,
    pub frontend_dir_path: Option<String>,

    // Storage
    pub storage_root: PathBuf,
    pub job_db: Option<PathBuf>,
    pub max_upload_bytes: u64,
    pub max_reference_upload_bytes: u64,

    // Retention
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub stuck_queued_max_age: Duration,

    // Processing
    pub worker_concurrency: usize,
    pub processing_timeout: Duration,
    pub reference_matching: bool,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();
        let retention_file = file.retention.unwrap_or_default();
        let processing_file = file.processing.unwrap_or_default();

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        let debug = file.debug.unwrap_or(cli.debug);

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let frontend_dir_path = file
            .frontend_dir_path
            .or_else(|| cli.frontend_dir_path.clone());

        let storage_root = file
            .storage_root
            .map(PathBuf::from)
            .unwrap_or_else(|| cli.storage_root.clone());
        if storage_root.exists() && !storage_root.is_dir() {
            bail!("storage_root is not a directory: {:?}", storage_root);
        }

        let job_db = file
            .job_db
            .map(PathBuf::from)
            .or_else(|| cli.job_db.clone());

        let max_upload_bytes = parse_size(
            "max_upload_size",
            file.max_upload_size
                .as_deref()
                .unwrap_or(&cli.max_upload_size),
        )?;
        let max_reference_upload_bytes = parse_size(
            "max_reference_upload_size",
            file.max_reference_upload_size
                .as_deref()
                .unwrap_or(&cli.max_reference_upload_size),
        )?;
        if max_reference_upload_bytes < max_upload_bytes {
            bail!(
                "max_reference_upload_size ({}) must not be smaller than max_upload_size ({})",
                max_reference_upload_bytes,
                max_upload_bytes
            );
        }

        let retention_minutes = retention_file
            .retention_minutes
            .unwrap_or(cli.retention_minutes);
        if retention_minutes == 0 {
            bail!("retention_minutes must be greater than 0");
        }
        let sweep_interval_secs = retention_file
            .sweep_interval_secs
            .unwrap_or(cli.sweep_interval_secs);
        if sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be greater than 0");
        }
        let stuck_queued_max_age_minutes = retention_file
            .stuck_queued_max_age_minutes
            .unwrap_or(cli.stuck_queued_max_age_minutes);
        if stuck_queued_max_age_minutes == 0 {
            bail!("stuck_queued_max_age_minutes must be greater than 0");
        }

        let worker_concurrency = processing_file
            .worker_concurrency
            .unwrap_or(cli.worker_concurrency);
        if worker_concurrency == 0 {
            bail!("worker_concurrency must be at least 1");
        }
        let processing_timeout_secs = processing_file
            .processing_timeout_secs
            .unwrap_or(cli.processing_timeout_secs);
        if processing_timeout_secs == 0 {
            bail!("processing_timeout_secs must be greater than 0");
        }
        let reference_matching = processing_file
            .reference_matching
            .unwrap_or(cli.reference_matching);
        let ffmpeg_path = PathBuf::from(
            processing_file
                .ffmpeg_path
                .unwrap_or_else(|| cli.ffmpeg_path.clone()),
        );
        let ffprobe_path = PathBuf::from(
            processing_file
                .ffprobe_path
                .unwrap_or_else(|| cli.ffprobe_path.clone()),
        );

        let secret_key = match file.secret_key.or_else(|| cli.secret_key.clone()) {
            Some(key) if !key.is_empty() => key,
            _ if debug => DEBUG_SECRET_KEY.to_string(),
            _ => {
                warn!("No secret key configured, generating a random one for this run");
                generate_secret_key()
            }
        };

        Ok(Self {
            secret_key,
            port,
            metrics_port,
            debug,
            logging_level,
            frontend_dir_path,
            storage_root,
            job_db,
            max_upload_bytes,
            max_reference_upload_bytes,
            retention: Duration::from_secs(retention_minutes * 60),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            stuck_queued_max_age: Duration::from_secs(stuck_queued_max_age_minutes * 60),
            worker_concurrency,
            processing_timeout: Duration::from_secs(processing_timeout_secs),
            reference_matching,
            ffmpeg_path,
            ffprobe_path,
        })
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            retention: self.retention,
            stuck_queued_max_age: self.stuck_queued_max_age,
        }
    }

    pub fn ingest_limits(&self) -> IngestLimits {
        IngestLimits {
            max_target_bytes: self.max_upload_bytes,
            max_reference_bytes: self.max_reference_upload_bytes,
        }
    }

    /// Illegal status transitions are fatal for the job task in debug mode.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_concurrency: self.worker_concurrency,
            processing_timeout: self.processing_timeout,
            strict_transitions: self.debug,
        }
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}

fn parse_size(name: &str, value: &str) -> Result<u64> {
    let bytes = Byte::parse_str(value, true)
        .map_err(|e| anyhow!("Invalid {} {:?}: {}", name, value, e))?
        .as_u64();
    if bytes == 0 {
        bail!("{} must be greater than 0", name);
    }
    Ok(bytes)
}

fn generate_secret_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SECRET_KEY_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_logging_level() {
        assert!(matches!(
            parse_logging_level("none"),
            Some(RequestsLoggingLevel::None)
        ));
        assert!(matches!(
            parse_logging_level("headers"),
            Some(RequestsLoggingLevel::Headers)
        ));
        // Case insensitive
        assert!(matches!(
            parse_logging_level("PATH"),
            Some(RequestsLoggingLevel::Path)
        ));
        assert!(parse_logging_level("invalid").is_none());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("x", "100 MiB").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_size("x", "200 MiB").unwrap(), 200 * 1024 * 1024);
        assert_eq!(parse_size("x", "1 MB").unwrap(), 1_000_000);
        assert_eq!(parse_size("x", "4096").unwrap(), 4096);
        assert!(parse_size("x", "lots").is_err());
        assert!(parse_size("x", "0").is_err());
    }

    #[test]
    fn test_resolve_defaults() {
        let config = AppConfig::resolve(&CliConfig::default(), None).unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.max_upload_bytes, 100 * 1024 * 1024);
        assert_eq!(config.max_reference_upload_bytes, 200 * 1024 * 1024);
        assert_eq!(config.retention, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.stuck_queued_max_age, Duration::from_secs(7200));
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.processing_timeout, Duration::from_secs(600));
        assert!(config.reference_matching);
        assert!(config.job_db.is_none());
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.ingest_limits(), IngestLimits::default());
        assert_eq!(config.retention_policy(), RetentionPolicy::default());
        assert!(!config.scheduler_config().strict_transitions);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let cli = CliConfig {
            port: 3001,
            metrics_port: 9999,
            logging_level: RequestsLoggingLevel::Path,
            worker_concurrency: 3,
            retention_minutes: 10,
            ..Default::default()
        };

        let file_config = FileConfig {
            port: Some(4000),
            logging_level: Some("body".to_string()),
            max_upload_size: Some("10 MiB".to_string()),
            retention: Some(RetentionConfig {
                retention_minutes: Some(5),
                ..Default::default()
            }),
            processing: Some(ProcessingConfig {
                reference_matching: Some(false),
                ffmpeg_path: Some("/opt/ffmpeg/bin/ffmpeg".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.port, 4000);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Body);
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.retention, Duration::from_secs(300));
        assert!(!config.reference_matching);
        assert_eq!(config.ffmpeg_path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        // CLI value used when TOML doesn't specify
        assert_eq!(config.metrics_port, 9999);
        assert_eq!(config.worker_concurrency, 3);
    }

    #[test]
    fn test_resolve_rejects_invalid_values() {
        let cases = [
            CliConfig {
                worker_concurrency: 0,
                ..Default::default()
            },
            CliConfig {
                processing_timeout_secs: 0,
                ..Default::default()
            },
            CliConfig {
                retention_minutes: 0,
                ..Default::default()
            },
            CliConfig {
                max_upload_size: "0".to_string(),
                ..Default::default()
            },
            CliConfig {
                max_upload_size: "300 MiB".to_string(),
                ..Default::default()
            },
        ];
        for cli in cases {
            assert!(AppConfig::resolve(&cli, None).is_err(), "{:?}", cli);
        }
    }

    #[test]
    fn test_resolve_storage_root_must_be_directory() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let cli = CliConfig {
            storage_root: temp_file.path().to_path_buf(),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }

    #[test]
    fn test_secret_key_resolution() {
        let configured = CliConfig {
            secret_key: Some("s3cret".to_string()),
            ..Default::default()
        };
        assert_eq!(
            AppConfig::resolve(&configured, None).unwrap().secret_key,
            "s3cret"
        );

        let debug = CliConfig {
            debug: true,
            ..Default::default()
        };
        let config = AppConfig::resolve(&debug, None).unwrap();
        assert_eq!(config.secret_key, DEBUG_SECRET_KEY);
        assert!(config.scheduler_config().strict_transitions);

        let first = AppConfig::resolve(&CliConfig::default(), None).unwrap();
        let second = AppConfig::resolve(&CliConfig::default(), None).unwrap();
        assert_eq!(first.secret_key.len(), GENERATED_SECRET_KEY_LEN);
        assert_ne!(first.secret_key, second.secret_key);
    }
}
