//! Archival: export a dataset to compressed artifacts, upload them, and
//! only then drop the dataset.

pub mod artifact;
pub mod export;
pub mod hooks;
pub mod pipeline;
pub mod retry;
pub mod upload;

use crate::dataset::DatasetError;
use crate::journal::JournalError;
use crate::status::StatusError;
use crate::store::StoreError;

pub use artifact::{ArtifactWriter, ScratchFile};
pub use hooks::{ExcludeWorkspaces, PreBackupHandler};
pub use pipeline::{ArchivalPipeline, ArchiveOutcome};
pub use retry::{BackoffPolicy, RetryError};
pub use upload::{BlobUploader, LocalDirUploader, UploadError, UploadOutput};

/// Failure of one archival cycle. The dataset is kept in every case.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("export failed: {0}")]
    ExportFailure(String),
    #[error("upload failed after {attempts} attempts: {reason}")]
    UploadFailure { attempts: u32, reason: String },
    #[error("pre-backup handler {handler} failed: {reason}")]
    Hook { handler: String, reason: String },
    #[error("archival cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Status(#[from] StatusError),
}
