//! Storage layout for uploads, intermediates and artifacts.
//!
//! ```text
//! <root>/uploads/<upload-id>/<sanitized name>   raw uploads, one directory each
//! <root>/work/<job-id>/                         intermediates, removed on completion
//! <root>/processed/<job-id>.<ext>               downloadable artifacts
//! ```

use crate::jobs::{ExportFormat, StoredFile};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const UPLOADS_DIR: &str = "uploads";
pub const WORK_DIR: &str = "work";
pub const PROCESSED_DIR: &str = "processed";

/// Errors that can occur during file handling.
#[derive(Debug, Error)]
pub enum FileHandlerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Path is outside the storage root: {0}")]
    OutsideRoot(String),
}

/// Owns the directory tree under the storage root.
#[derive(Debug, Clone)]
pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    pub fn work_root(&self) -> PathBuf {
        self.root.join(WORK_DIR)
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join(PROCESSED_DIR)
    }

    /// Creates the storage directories.
    pub async fn init(&self) -> Result<(), FileHandlerError> {
        fs::create_dir_all(self.uploads_dir()).await?;
        fs::create_dir_all(self.work_root()).await?;
        fs::create_dir_all(self.processed_dir()).await?;
        Ok(())
    }

    /// Persists an uploaded file into a fresh directory of its own.
    pub async fn save_upload(
        &self,
        original_name: &str,
        data: &[u8],
    ) -> Result<StoredFile, FileHandlerError> {
        let safe_filename = sanitize_filename(original_name)?;

        let upload_dir = self.uploads_dir().join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&upload_dir).await?;

        let file_path = upload_dir.join(&safe_filename);
        let mut file = fs::File::create(&file_path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(StoredFile {
            path: file_path,
            original_name: original_name.to_string(),
            size_bytes: data.len() as u64,
        })
    }

    /// Removes an upload together with its directory.
    pub async fn remove_upload(&self, file: &StoredFile) -> Result<(), FileHandlerError> {
        let dir = file
            .path
            .parent()
            .filter(|p| p.parent() == Some(self.uploads_dir().as_path()))
            .ok_or_else(|| FileHandlerError::OutsideRoot(file.path.display().to_string()))?;
        remove_dir_if_exists(dir).await
    }

    pub fn work_dir(&self, job_id: &str) -> PathBuf {
        self.work_root().join(job_id)
    }

    /// Create a job-specific work directory.
    pub async fn create_work_dir(&self, job_id: &str) -> Result<PathBuf, FileHandlerError> {
        let dir = self.work_dir(job_id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Clean up a job's intermediates.
    pub async fn cleanup_work_dir(&self, job_id: &str) -> Result<(), FileHandlerError> {
        remove_dir_if_exists(&self.work_dir(job_id)).await
    }

    /// Where the artifact of `job_id` is written.
    pub fn output_path(&self, job_id: &str, format: ExportFormat) -> PathBuf {
        self.processed_dir()
            .join(format!("{}.{}", job_id, format.extension()))
    }

    /// Removes an artifact. Missing files are not an error.
    pub async fn remove_output(&self, path: &Path) -> Result<(), FileHandlerError> {
        if !path.starts_with(self.processed_dir()) {
            return Err(FileHandlerError::OutsideRoot(path.display().to_string()));
        }
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), FileHandlerError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Sanitize a filename to prevent path traversal attacks.
pub fn sanitize_filename(filename: &str) -> Result<String, FileHandlerError> {
    // Browsers on Windows may send full paths
    let last_component = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let name = Path::new(last_component)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FileHandlerError::InvalidFilename(filename.to_string()))?;

    // Null bytes, hidden files and ".." are never allowed
    if name.contains('\0') || name.starts_with('.') || name == ".." {
        return Err(FileHandlerError::InvalidFilename(filename.to_string()));
    }

    let sanitized: String = name
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect();

    if sanitized.trim().is_empty() {
        return Err(FileHandlerError::InvalidFilename(filename.to_string()));
    }

    Ok(sanitized)
}
