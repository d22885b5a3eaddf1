//! Test server lifecycle management
//!
//! This module manages spawning and shutting down test HTTP servers.
//! Each test gets an isolated server with its own storage root and job store,
//! backed by the in-process converter and engine so no ffmpeg is needed.

use super::constants::*;
use mastering_server::ingest::{FileHandler, IngestLimits, MediaIngest};
use mastering_server::jobs::{InMemoryJobStore, JobStore};
use mastering_server::mastering::MasteringPipeline;
use mastering_server::scheduler::{JobScheduler, SchedulerConfig};
use mastering_server::server::{make_app, RequestsLoggingLevel, ServerConfig};
use mastering_server::testing::{FakeConverter, FakeEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Knobs for the collaborators behind the test server
pub struct TestServerOptions {
    pub engine: FakeEngine,
    pub converter: FakeConverter,
    pub scheduler: SchedulerConfig,
    pub limits: IngestLimits,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            engine: FakeEngine::default(),
            converter: FakeConverter::default(),
            scheduler: SchedulerConfig {
                worker_concurrency: 2,
                processing_timeout: Duration::from_secs(5),
                strict_transitions: true,
            },
            limits: IngestLimits::default(),
        }
    }
}

/// Test server instance with isolated storage
///
/// When dropped, the server gracefully shuts down and temp resources are cleaned up.
#[allow(dead_code)]
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Job store for direct access in tests
    pub store: Arc<dyn JobStore>,

    /// Storage layout used by the server
    pub files: FileHandler,

    /// Engine behind the pipeline, for call counting
    pub engine: Arc<FakeEngine>,

    pub scheduler: JobScheduler,

    // Private fields - keep resources alive until drop
    _temp_dir: TempDir,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TestServer {
    /// Spawns a new test server on a random port with default collaborators
    pub async fn spawn() -> Self {
        Self::spawn_with(TestServerOptions::default()).await
    }

    /// Spawns a new test server on a random port
    ///
    /// This function:
    /// 1. Creates a temporary storage root
    /// 2. Wires an in-memory job store, the fakes and a scheduler
    /// 3. Binds to a random port (127.0.0.1:0)
    /// 4. Spawns the server in a background task
    /// 5. Waits for the server to be ready
    ///
    /// # Panics
    ///
    /// Panics if the storage root cannot be created, port binding fails,
    /// or the server doesn't become ready within timeout.
    pub async fn spawn_with(options: TestServerOptions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create storage root");
        let files = FileHandler::new(temp_dir.path());
        files.init().await.expect("Failed to initialize storage");

        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let engine = Arc::new(options.engine);
        let converter = Arc::new(options.converter);

        let scheduler = JobScheduler::new(
            store.clone(),
            files.clone(),
            MediaIngest::new(converter.clone(), options.limits),
            MasteringPipeline::new(engine.clone(), converter),
            options.scheduler,
        );

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");

        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let base_url = format!("http://127.0.0.1:{}", port);

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let config = ServerConfig {
            port,
            metrics_port: 0,
            requests_logging_level: RequestsLoggingLevel::None,
            frontend_dir_path: None,
            max_upload_bytes: options.limits.max_target_bytes,
            max_reference_upload_bytes: options.limits.max_reference_bytes,
        };
        let app = make_app(config, scheduler.clone());

        // Spawn server in background task with graceful shutdown
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            store,
            files,
            engine,
            scheduler,
            _temp_dir: temp_dir,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    pub fn storage_root(&self) -> PathBuf {
        self.files.root().to_path_buf()
    }

    /// Waits for the server to become ready by polling the / endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => {
                    return;
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
        // TempDir will be cleaned up automatically
    }
}
