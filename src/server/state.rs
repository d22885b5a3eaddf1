use axum::extract::FromRef;

use crate::jobs::JobStore;
use crate::scheduler::JobScheduler;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedJobStore = Arc<dyn JobStore>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub scheduler: JobScheduler,
    pub hash: String,
}

impl ServerState {
    pub fn new(config: ServerConfig, scheduler: JobScheduler) -> ServerState {
        ServerState {
            config,
            start_time: Instant::now(),
            scheduler,
            hash: format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("GIT_HASH")),
        }
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for JobScheduler {
    fn from_ref(input: &ServerState) -> Self {
        input.scheduler.clone()
    }
}

impl FromRef<ServerState> for GuardedJobStore {
    fn from_ref(input: &ServerState) -> Self {
        input.scheduler.store().clone()
    }
}
