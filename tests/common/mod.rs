//! Common test infrastructure
//!
//! This module provides all the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{wav_bytes, TestClient, TestServer, TARGET_FILENAME};
//!
//! #[tokio::test]
//! async fn test_upload() {
//!     let server = TestServer::spawn().await;
//!     let client = TestClient::new(server.base_url.clone());
//!
//!     let job_id = client.upload_track(TARGET_FILENAME, wav_bytes(), &[]).await;
//!     let (status, _) = client.wait_for_terminal(&job_id).await;
//!     assert_eq!(status["status"], "completed");
//! }
//! ```

mod client;
mod constants;
mod fixtures;
mod server;

// Public API - this is what tests import
#[allow(unused_imports)]
pub use client::{TestClient, UploadFile};
pub use constants::*;
#[allow(unused_imports)]
pub use fixtures::{corrupt_bytes, image_bytes, wav_bytes};
#[allow(unused_imports)]
pub use server::{TestServer, TestServerOptions};
