//! Object-storage boundary for archival artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutput {
    pub location: String,
}

/// Uploads a local file under a list of key prefixes.
#[async_trait]
pub trait BlobUploader: Send + Sync + std::fmt::Debug {
    /// Provider label used in metrics (e.g. `S3`).
    fn provider(&self) -> &str;

    async fn upload(&self, path: &Path, prefixes: &[String]) -> Result<UploadOutput, UploadError>;
}

/// Uploader that copies artifacts into a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalDirUploader {
    base_path: PathBuf,
    provider: String,
}

impl LocalDirUploader {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            provider: "LOCAL".to_string(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    fn object_path(&self, prefixes: &[String], file_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        for prefix in prefixes {
            path.push(prefix);
        }
        path.push(file_name);
        path
    }
}

#[async_trait]
impl BlobUploader for LocalDirUploader {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn upload(&self, path: &Path, prefixes: &[String]) -> Result<UploadOutput, UploadError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| UploadError::Rejected(format!("not a file: {}", path.display())))?;
        let target = self.object_path(prefixes, file_name);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = fs::copy(path, &target).await?;

        tracing::debug!(target = %target.display(), bytes, "artifact stored");
        Ok(UploadOutput {
            location: target.display().to_string(),
        })
    }
}
