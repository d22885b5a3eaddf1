//! Mastering jobs: data model and registry.

mod models;
mod sqlite_store;
mod store;

pub use models::{
    ExportFormat, Job, JobId, JobStatus, MasteringMethod, MasteringParams, MethodUsed, NewJob,
    StatusUpdate, StoredFile, TierAttempt,
};
pub use sqlite_store::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError, RetentionPolicy};
