use super::RequestsLoggingLevel;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub requests_logging_level: RequestsLoggingLevel,
    pub port: u16,
    pub metrics_port: u16,
    pub frontend_dir_path: Option<String>,
    /// Largest accepted target upload, in bytes.
    pub max_upload_bytes: u64,
    /// Largest accepted reference upload, in bytes.
    pub max_reference_upload_bytes: u64,
}

/// Room for the multipart framing and the small text fields.
const FORM_OVERHEAD_BYTES: u64 = 1024 * 1024;

impl ServerConfig {
    /// Request body ceiling for `POST /upload`: both files plus form overhead.
    /// Individual files are checked against their own ceiling during ingest.
    pub fn upload_body_limit(&self) -> usize {
        let total = self
            .max_upload_bytes
            .saturating_add(self.max_reference_upload_bytes)
            .saturating_add(FORM_OVERHEAD_BYTES);
        usize::try_from(total).unwrap_or(usize::MAX)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            requests_logging_level: RequestsLoggingLevel::Path,
            port: 5000,
            metrics_port: 9091,
            frontend_dir_path: None,
            max_upload_bytes: 100 * 1024 * 1024,
            max_reference_upload_bytes: 200 * 1024 * 1024,
        }
    }
}
