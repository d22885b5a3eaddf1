//! Background execution of mastering jobs.

mod scheduler;

pub use scheduler::{JobFailure, JobScheduler, MasteringRequest, SchedulerConfig};
