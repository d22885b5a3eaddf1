pub mod config;
mod http_layers;
mod mastering_routes;
pub mod metrics;
#[allow(clippy::module_inception)]
pub mod server;
pub mod state;
mod status_page;

pub use config::ServerConfig;
pub use http_layers::*;
pub use mastering_routes::JobStatusResponse;
pub use server::{make_app, run_server};
