//! HTTP client for end-to-end tests
//!
//! This module provides a high-level HTTP client that wraps reqwest
//! and provides methods for all mastering-server endpoints.
//!
//! When API routes or request formats change, update only this file.

use super::constants::*;
use reqwest::multipart::{Form, Part};
use reqwest::Response;
use serde_json::Value;
use std::time::Duration;

/// A file part of the upload form
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: &str, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            bytes,
        }
    }
}

/// HTTP test client
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

#[allow(dead_code)]
impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// POST /upload with any combination of files and form fields
    pub async fn upload(
        &self,
        target: Option<UploadFile>,
        reference: Option<UploadFile>,
        fields: &[(&str, &str)],
    ) -> Response {
        let mut form = Form::new();
        if let Some(target) = target {
            form = form.part(
                "target_file",
                Part::bytes(target.bytes).file_name(target.name),
            );
        }
        if let Some(reference) = reference {
            form = form.part(
                "reference_file",
                Part::bytes(reference.bytes).file_name(reference.name),
            );
        }
        for (name, value) in fields {
            form = form.text(name.to_string(), value.to_string());
        }

        self.client
            .post(format!("{}/upload", self.base_url))
            .multipart(form)
            .send()
            .await
            .expect("Upload request failed")
    }

    /// Uploads a single track and returns the new job id
    ///
    /// # Panics
    ///
    /// Panics if the server does not accept the upload.
    pub async fn upload_track(
        &self,
        name: &str,
        bytes: Vec<u8>,
        fields: &[(&str, &str)],
    ) -> String {
        let response = self
            .upload(Some(UploadFile::new(name, bytes)), None, fields)
            .await;
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        let body: Value = response.json().await.expect("Invalid upload response");
        body["job_id"]
            .as_str()
            .expect("Upload response without job_id")
            .to_string()
    }

    // ========================================================================
    // Status and download
    // ========================================================================

    /// GET /
    pub async fn home(&self) -> Response {
        self.client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .expect("Home request failed")
    }

    /// GET /api/status/{id}
    pub async fn get_api_status(&self, id: &str) -> Response {
        self.client
            .get(format!("{}/api/status/{}", self.base_url, id))
            .send()
            .await
            .expect("Status request failed")
    }

    /// GET /status/{id}
    pub async fn get_status_page(&self, id: &str) -> Response {
        self.client
            .get(format!("{}/status/{}", self.base_url, id))
            .send()
            .await
            .expect("Status page request failed")
    }

    /// GET /download/{id}
    pub async fn download(&self, id: &str) -> Response {
        self.client
            .get(format!("{}/download/{}", self.base_url, id))
            .send()
            .await
            .expect("Download request failed")
    }

    /// Polls the JSON status until the job is completed or failed
    ///
    /// Returns the final status body and every distinct status seen, in order.
    ///
    /// # Panics
    ///
    /// Panics if the job does not settle within `JOB_COMPLETION_TIMEOUT_MS`.
    pub async fn wait_for_terminal(&self, id: &str) -> (Value, Vec<String>) {
        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(JOB_COMPLETION_TIMEOUT_MS);
        let mut observed: Vec<String> = Vec::new();

        loop {
            let response = self.get_api_status(id).await;
            assert_eq!(response.status(), reqwest::StatusCode::OK);
            let body: Value = response.json().await.expect("Invalid status response");
            let status = body["status"].as_str().unwrap_or_default().to_string();
            if observed.last() != Some(&status) {
                observed.push(status.clone());
            }
            if status == "completed" || status == "failed" {
                return (body, observed);
            }

            if start.elapsed() > timeout {
                panic!(
                    "Job {} did not finish within {}ms, last status {}",
                    id, JOB_COMPLETION_TIMEOUT_MS, status
                );
            }
            tokio::time::sleep(Duration::from_millis(JOB_POLL_INTERVAL_MS)).await;
        }
    }
}
