use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mastering_server::config;
use mastering_server::ffmpeg::Ffmpeg;
use mastering_server::ingest::{AudioConverter, FfmpegConverter, FileHandler, MediaIngest};
use mastering_server::jobs::{InMemoryJobStore, JobStore, SqliteJobStore};
use mastering_server::mastering::{FfmpegMasteringEngine, MasteringPipeline};
use mastering_server::retention::RetentionSweeper;
use mastering_server::scheduler::JobScheduler;
use mastering_server::server::{metrics, run_server, RequestsLoggingLevel, ServerConfig};

/// Recorded on jobs that were still pending when a previous process exited.
const INTERRUPTED_REASON: &str = "interrupted by server restart";

/// How long in-flight jobs may keep running once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[clap(version, about = "Audio mastering web service")]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, env = "MASTERING_CONFIG", value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Secret key, reserved for signing tokens. Generated when missing.
    #[clap(long, env = "MASTERING_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// The port to listen on.
    #[clap(short, long, env = "MASTERING_PORT", default_value_t = 5000)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, env = "MASTERING_METRICS_PORT", default_value_t = 9091)]
    pub metrics_port: u16,

    /// Development mode: verbose logs and strict job state checks.
    #[clap(long, env = "MASTERING_DEBUG")]
    pub debug: bool,

    /// The level of logging to perform on each request.
    #[clap(long, env = "MASTERING_LOGGING_LEVEL", default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Path to the frontend directory to be statically served.
    #[clap(long, env = "MASTERING_FRONTEND_DIR_PATH")]
    pub frontend_dir_path: Option<String>,

    /// Directory holding uploads, intermediates and mastered files.
    #[clap(
        long,
        env = "MASTERING_STORAGE_ROOT",
        value_parser = parse_path,
        default_value = "storage"
    )]
    pub storage_root: PathBuf,

    /// SQLite file for job records. Jobs are kept in memory when not set.
    #[clap(long, env = "MASTERING_JOB_DB", value_parser = parse_path)]
    pub job_db: Option<PathBuf>,

    /// Maximum size of the track to master, e.g. "100 MiB".
    #[clap(
        long,
        env = "MASTERING_MAX_UPLOAD_SIZE",
        default_value = config::DEFAULT_MAX_UPLOAD_SIZE
    )]
    pub max_upload_size: String,

    /// Maximum size of the reference track.
    #[clap(
        long,
        env = "MASTERING_MAX_REFERENCE_UPLOAD_SIZE",
        default_value = config::DEFAULT_MAX_REFERENCE_UPLOAD_SIZE
    )]
    pub max_reference_upload_size: String,

    /// Minutes a finished job and its files are kept.
    #[clap(long, env = "MASTERING_RETENTION_MINUTES", default_value_t = 60)]
    pub retention_minutes: u64,

    /// Seconds between retention sweeps.
    #[clap(long, env = "MASTERING_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    pub sweep_interval_secs: u64,

    /// Minutes after which a job still queued is considered stuck and purged.
    #[clap(long, env = "MASTERING_STUCK_QUEUED_MAX_AGE_MINUTES", default_value_t = 120)]
    pub stuck_queued_max_age_minutes: u64,

    /// Jobs processed at the same time.
    #[clap(long, env = "MASTERING_WORKER_CONCURRENCY", default_value_t = 2)]
    pub worker_concurrency: usize,

    /// Seconds a job may spend processing before it is failed.
    #[clap(long, env = "MASTERING_PROCESSING_TIMEOUT_SECS", default_value_t = 600)]
    pub processing_timeout_secs: u64,

    /// Enable reference matching.
    #[clap(
        long,
        env = "MASTERING_REFERENCE_MATCHING",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub reference_matching: bool,

    /// ffmpeg executable.
    #[clap(long, env = "MASTERING_FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg_path: String,

    /// ffprobe executable.
    #[clap(long, env = "MASTERING_FFPROBE_PATH", default_value = "ffprobe")]
    pub ffprobe_path: String,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            secret_key: args.secret_key.clone(),
            port: args.port,
            metrics_port: args.metrics_port,
            debug: args.debug,
            logging_level: args.logging_level.clone(),
            frontend_dir_path: args.frontend_dir_path.clone(),
            storage_root: args.storage_root.clone(),
            job_db: args.job_db.clone(),
            max_upload_size: args.max_upload_size.clone(),
            max_reference_upload_size: args.max_reference_upload_size.clone(),
            retention_minutes: args.retention_minutes,
            sweep_interval_secs: args.sweep_interval_secs,
            stuck_queued_max_age_minutes: args.stuck_queued_max_age_minutes,
            worker_concurrency: args.worker_concurrency,
            processing_timeout_secs: args.processing_timeout_secs,
            reference_matching: args.reference_matching,
            ffmpeg_path: args.ffmpeg_path.clone(),
            ffprobe_path: args.ffprobe_path.clone(),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let default_level = if cli_args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  storage_root: {:?}", app_config.storage_root);
    info!("  port: {}", app_config.port);
    info!("  debug: {}", app_config.debug);
    info!(
        "  upload limits: {} bytes (target), {} bytes (reference)",
        app_config.max_upload_bytes, app_config.max_reference_upload_bytes
    );
    info!(
        "  workers: {}, processing timeout: {:?}, retention: {:?}",
        app_config.worker_concurrency, app_config.processing_timeout, app_config.retention
    );

    info!("Initializing metrics...");
    metrics::init_metrics();

    let files = FileHandler::new(&app_config.storage_root);
    files
        .init()
        .await
        .with_context(|| format!("Failed to prepare storage at {:?}", app_config.storage_root))?;

    let store: Arc<dyn JobStore> = match &app_config.job_db {
        Some(path) => {
            info!("Opening SQLite job database at {:?}...", path);
            Arc::new(SqliteJobStore::open(path)?)
        }
        None => {
            info!("Keeping job records in memory");
            Arc::new(InMemoryJobStore::new())
        }
    };
    let interrupted = store
        .fail_interrupted(INTERRUPTED_REASON)
        .context("Failed to settle jobs from a previous run")?;
    if interrupted > 0 {
        warn!(
            "Marked {} job(s) left unfinished by a previous run as failed",
            interrupted
        );
    }

    let ffmpeg = Ffmpeg::new(
        app_config.ffmpeg_path.clone(),
        app_config.ffprobe_path.clone(),
    );
    if let Err(e) = ffmpeg.check_available().await {
        warn!(
            "ffmpeg is not usable ({}), every job will fail until it is installed",
            e
        );
    }

    let converter: Arc<dyn AudioConverter> = Arc::new(FfmpegConverter::new(ffmpeg.clone()));
    let engine = Arc::new(FfmpegMasteringEngine::new(
        ffmpeg,
        app_config.reference_matching,
    ));
    if !app_config.reference_matching {
        info!("Reference matching disabled, reference jobs use parameter mastering");
    }
    let pipeline = MasteringPipeline::new(engine, converter.clone());
    let ingest = MediaIngest::new(converter, app_config.ingest_limits());
    let scheduler = JobScheduler::new(
        store.clone(),
        files.clone(),
        ingest,
        pipeline,
        app_config.scheduler_config(),
    );

    let shutdown_token = CancellationToken::new();

    info!(
        "Retention sweeper: keeping jobs {:?}, sweeping every {:?}",
        app_config.retention, app_config.sweep_interval
    );
    let sweeper = Arc::new(RetentionSweeper::new(
        store,
        files,
        app_config.retention_policy(),
    ));
    let sweeper_handle = sweeper.spawn(app_config.sweep_interval, shutdown_token.child_token());

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let server_config = ServerConfig {
        requests_logging_level: app_config.logging_level.clone(),
        port: app_config.port,
        metrics_port: app_config.metrics_port,
        frontend_dir_path: app_config.frontend_dir_path.clone(),
        max_upload_bytes: app_config.max_upload_bytes,
        max_reference_upload_bytes: app_config.max_reference_upload_bytes,
    };
    let result = run_server(server_config, scheduler.clone(), shutdown_token.clone()).await;

    shutdown_token.cancel();
    if let Err(e) = sweeper_handle.await {
        error!("Retention sweeper task failed: {}", e);
    }
    if !scheduler.shutdown(SHUTDOWN_GRACE).await {
        warn!(
            "Some jobs did not finish before shutdown; \
             they will be marked failed on restart if persisted"
        );
    }

    result
}
