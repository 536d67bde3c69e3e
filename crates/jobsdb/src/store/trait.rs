use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use strata_core::{JobId, JobState, TenantId};

use crate::dataset::Dataset;
use crate::job::{Job, NewJob, NewStatus};

/// Storage backend error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The dataset's tables do not exist (never created, or dropped).
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Raw aggregate bounds of a job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRange {
    pub min_job_id: JobId,
    pub max_job_id: JobId,
    pub min_created_at: DateTime<Utc>,
    pub max_created_at: DateTime<Utc>,
}

/// Result of an atomic check-and-append of a status row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { status_id: i64, workspace_id: TenantId },
    /// The job does not live in this dataset.
    UnknownJob,
    /// The job's latest state does not allow the requested transition.
    Rejected { current: Option<JobState> },
}

/// Selection of pickable jobs for one tenant in one dataset.
#[derive(Debug, Clone, Copy)]
pub struct PickupQuery {
    pub tenant: TenantId,
    pub limit: usize,
    /// Failed jobs become pickable again once their retry time has passed.
    pub now: DateTime<Utc>,
}

/// What an archival export reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportMode {
    /// Every job row, ordered by job id.
    Complete,
    /// Every status row, ordered by job id then status id.
    StatusOnly,
    /// Jobs whose latest status is `failed` or `aborted`, joined with that
    /// status, ordered by custom value, job id and execution time.
    FailedOnly,
}

impl ExportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportMode::Complete => "complete",
            ExportMode::StatusOnly => "status_only",
            ExportMode::FailedOnly => "failed_only",
        }
    }
}

/// Which jobs stay in a dataset for archival; the others are migrated out
/// first so no undelivered work is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Jobs whose latest state is terminal.
    #[default]
    Terminal,
    /// Terminal jobs plus jobs whose latest attempt failed. Failed-only
    /// queues archive failures instead of retrying them.
    TerminalOrFailed,
}

impl Retention {
    pub fn for_failed_only(failed_only: bool) -> Self {
        if failed_only {
            Retention::TerminalOrFailed
        } else {
            Retention::Terminal
        }
    }

    /// Latest states that let a job stay behind.
    pub fn settled_states(self) -> &'static [JobState] {
        match self {
            Retention::Terminal => &[JobState::Succeeded, JobState::Aborted],
            Retention::TerminalOrFailed => &[JobState::Succeeded, JobState::Aborted, JobState::Failed],
        }
    }

    /// Whether a job with this latest state must be migrated out.
    pub fn is_unfinished(self, latest: Option<JobState>) -> bool {
        !latest.is_some_and(|state| self.settled_states().contains(&state))
    }
}

/// One size-bounded page of an export.
///
/// At most `limit` rows are read from `offset`; of those, the longest prefix
/// whose cumulative payload size stays within `max_payload_bytes` is returned,
/// and always at least the first row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportBatch {
    pub offset: u64,
    pub limit: usize,
    pub max_payload_bytes: u64,
}

/// A persisted journal row.
#[derive(Debug, Clone, PartialEq)]
pub struct RawJournalEntry {
    pub id: i64,
    pub owner: String,
    pub operation: String,
    pub payload: JsonValue,
    pub start_time: DateTime<Utc>,
}

/// Storage boundary of the queue.
///
/// All multi-row mutations are atomic. Dataset-scoped methods fail with
/// `StoreError::DatasetNotFound` when the dataset's tables are missing.
#[async_trait]
pub trait JobStorage: Send + Sync + std::fmt::Debug + 'static {
    /// Datasets of a queue in catalog order (unsorted).
    async fn list_datasets(&self, prefix: &str) -> Result<Vec<Dataset>, StoreError>;

    /// Create the dataset's tables. Creating an existing dataset is a no-op.
    async fn create_dataset(&self, dataset: &Dataset) -> Result<(), StoreError>;

    /// Drop the dataset's tables. Dropping a missing dataset is a no-op.
    async fn drop_dataset(&self, dataset: &Dataset) -> Result<(), StoreError>;

    /// `None` when the dataset holds no jobs.
    async fn job_range(&self, dataset: &Dataset) -> Result<Option<RawRange>, StoreError>;

    async fn count_jobs(&self, dataset: &Dataset) -> Result<u64, StoreError>;

    /// Insert jobs, assigning ids from the queue-wide sequence in input order.
    async fn insert_jobs(&self, dataset: &Dataset, jobs: &[NewJob]) -> Result<Vec<JobId>, StoreError>;

    /// Check the job's latest state against `status.job_state` and append the
    /// row, as one atomic step.
    async fn append_status(
        &self,
        dataset: &Dataset,
        status: &NewStatus,
    ) -> Result<AppendOutcome, StoreError>;

    /// Delete all but the `keep` most recent status rows of every job.
    async fn compact_statuses(&self, dataset: &Dataset, keep: usize) -> Result<u64, StoreError>;

    /// Jobs of one tenant with no status or a latest state of `waiting`,
    /// `throttled`, or `failed` past its retry time; ascending job id.
    async fn pickable_jobs(&self, dataset: &Dataset, query: &PickupQuery) -> Result<Vec<Job>, StoreError>;

    /// Number of pickable jobs per tenant.
    async fn pending_counts(
        &self,
        dataset: &Dataset,
        now: DateTime<Utc>,
    ) -> Result<HashMap<TenantId, u64>, StoreError>;

    /// Jobs that `retention` does not let stay behind.
    async fn count_unfinished(&self, dataset: &Dataset, retention: Retention) -> Result<u64, StoreError>;

    /// In one transaction: create `to`, move every job of `from` that
    /// `retention` counts as unfinished together with its status rows into
    /// it, and delete them from `from`.
    async fn migrate_unfinished(
        &self,
        from: &Dataset,
        to: &Dataset,
        retention: Retention,
    ) -> Result<u64, StoreError>;

    /// Delete the jobs (and their statuses) of the given tenants.
    async fn delete_jobs_for_tenants(
        &self,
        dataset: &Dataset,
        tenants: &[TenantId],
    ) -> Result<u64, StoreError>;

    async fn count_export_rows(&self, dataset: &Dataset, mode: ExportMode) -> Result<u64, StoreError>;

    /// Rows of one export page, each a JSON object.
    async fn export_batch(
        &self,
        dataset: &Dataset,
        mode: ExportMode,
        batch: &ExportBatch,
    ) -> Result<Vec<JsonValue>, StoreError>;

    async fn journal_insert(
        &self,
        owner: &str,
        operation: &str,
        payload: &JsonValue,
    ) -> Result<i64, StoreError>;

    async fn journal_delete(&self, id: i64) -> Result<(), StoreError>;

    /// Entries of one owner, oldest first.
    async fn journal_entries(&self, owner: &str) -> Result<Vec<RawJournalEntry>, StoreError>;
}
