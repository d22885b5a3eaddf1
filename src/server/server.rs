use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{error, info};

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use super::mastering_routes::mastering_routes;
use super::{log_requests, metrics, state::ServerState, ServerConfig};
use crate::jobs::JobStatus;
use crate::scheduler::JobScheduler;

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub hash: String,
    pub jobs: HashMap<JobStatus, usize>,
    pub active_workers: usize,
    pub worker_capacity: usize,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> Response {
    let mut jobs = match state.scheduler.store().count_by_status() {
        Ok(counts) => counts,
        Err(e) => {
            error!("Failed to count jobs: {}", e);
            metrics::record_error("store", "home");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    for status in [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ] {
        jobs.entry(status).or_insert(0);
    }

    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        hash: state.hash.clone(),
        jobs,
        active_workers: state.scheduler.active_workers(),
        worker_capacity: state.scheduler.config().worker_concurrency,
    };
    Json(stats).into_response()
}

pub fn make_app(config: ServerConfig, scheduler: JobScheduler) -> Router {
    let state = ServerState::new(config.clone(), scheduler);

    let home_router: Router<ServerState> = match &config.frontend_dir_path {
        Some(frontend_path) => {
            let static_files_service =
                ServeDir::new(frontend_path).append_index_html_on_directories(true);
            Router::new().fallback_service(static_files_service)
        }
        None => Router::new().route("/", get(home)),
    };

    home_router
        .merge(mastering_routes(&config))
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .with_state(state)
}

fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics::metrics_handler))
}

/// Serves the app on `config.port` and Prometheus metrics on
/// `config.metrics_port` until `shutdown` is cancelled.
pub async fn run_server(
    config: ServerConfig,
    scheduler: JobScheduler,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = config.port;
    let metrics_port = config.metrics_port;
    let app = make_app(config, scheduler);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    let metrics_listener = tokio::net::TcpListener::bind(("0.0.0.0", metrics_port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", metrics_port))?;

    let metrics_shutdown = shutdown.clone();
    let metrics_server = tokio::spawn(async move {
        let result = axum::serve(metrics_listener, make_metrics_app())
            .with_graceful_shutdown(metrics_shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            error!("Metrics server error: {}", e);
        }
    });

    info!("Ready to serve at port {}!", port);
    info!("Metrics available at port {}!", metrics_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("HTTP server error")?;

    // The main server can also stop on its own; take the metrics one down with it
    shutdown.cancel();
    if let Err(e) = metrics_server.await {
        error!("Metrics server task failed: {}", e);
    }
    info!("HTTP server stopped");
    Ok(())
}
