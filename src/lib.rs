//! Mastering Server Library
//!
//! Accepts audio uploads, masters them in the background through a tiered
//! fallback pipeline and serves the results for download. The modules are
//! exposed for the binary, the end-to-end tests and potential reuse.

pub mod config;
pub mod ffmpeg;
pub mod ingest;
pub mod jobs;
pub mod mastering;
pub mod retention;
pub mod scheduler;
pub mod server;
pub mod testing;

// Re-export commonly used types for convenience
pub use jobs::{InMemoryJobStore, Job, JobStatus, JobStore, SqliteJobStore};
pub use retention::RetentionSweeper;
pub use scheduler::{JobScheduler, MasteringRequest, SchedulerConfig};
pub use server::{make_app, run_server, RequestsLoggingLevel, ServerConfig};
