//! Status recording with the job lifecycle rules enforced.

use std::sync::Arc;

use tracing::{debug, instrument};

use strata_core::{JobId, JobState, TenantId};

use crate::dataset::{Dataset, DatasetError, DatasetManager};
use crate::job::NewStatus;
use crate::store::{AppendOutcome, StoreError};

/// Status rows kept per job by compaction.
pub const KEEP_STATUSES_PER_JOB: usize = 2;

/// Dataset scans per status before the job is reported unknown.
const MAX_SCANS: usize = 3;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StatusError {
    #[error("job {job_id}: cannot move from {} to {to}", .from.map_or("no status", |s| s.as_str()))]
    InvalidTransition {
        job_id: JobId,
        from: Option<JobState>,
        to: JobState,
    },
    #[error("job {job_id}: attempt {attempt} exceeds the limit of {max_attempts}")]
    AttemptLimit {
        job_id: JobId,
        attempt: u32,
        max_attempts: u32,
    },
    #[error("job {0} is not in any live dataset")]
    UnknownJob(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DatasetError> for StatusError {
    fn from(err: DatasetError) -> Self {
        match err {
            DatasetError::Store(e) => StatusError::Store(e),
            other => StatusError::Store(StoreError::Storage(other.to_string())),
        }
    }
}

/// A status row as it was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStatus {
    pub status_id: i64,
    pub workspace_id: TenantId,
    pub dataset: Dataset,
    /// May differ from the requested state (`failed` becomes `aborted` at
    /// the attempt ceiling).
    pub job_state: JobState,
}

#[derive(Debug, Clone)]
pub struct StatusTracker {
    manager: Arc<DatasetManager>,
    max_attempts: u32,
}

impl StatusTracker {
    pub fn new(manager: Arc<DatasetManager>, max_attempts: u32) -> Self {
        Self { manager, max_attempts }
    }

    /// Apply the attempt ceiling to a requested status.
    fn normalize(&self, mut status: NewStatus) -> Result<NewStatus, StatusError> {
        match status.job_state {
            JobState::Failed if status.attempt >= self.max_attempts => {
                status.job_state = JobState::Aborted;
            }
            JobState::Executing if status.attempt > self.max_attempts => {
                return Err(StatusError::AttemptLimit {
                    job_id: status.job_id,
                    attempt: status.attempt,
                    max_attempts: self.max_attempts,
                });
            }
            _ => {}
        }
        Ok(status)
    }

    /// Append a status to whichever live dataset holds the job.
    ///
    /// A migration may move the job while the datasets are scanned; the
    /// scan is repeated while the dataset listing keeps changing.
    #[instrument(skip(self, status), fields(job_id = %status.job_id, state = %status.job_state), err)]
    pub async fn record_status(&self, status: NewStatus) -> Result<RecordedStatus, StatusError> {
        let status = self.normalize(status)?;
        let mut datasets = self.manager.list_datasets().await?;

        for _ in 0..MAX_SCANS {
            if let Some(recorded) = self.scan(&datasets, &status).await? {
                return Ok(recorded);
            }
            let relisted = self.manager.list_datasets().await?;
            if relisted == datasets {
                break;
            }
            debug!("datasets changed during the scan, rescanning");
            datasets = relisted;
        }

        Err(StatusError::UnknownJob(status.job_id))
    }

    /// `None` when no dataset in `datasets` holds the job.
    async fn scan(
        &self,
        datasets: &[Dataset],
        status: &NewStatus,
    ) -> Result<Option<RecordedStatus>, StatusError> {
        let current = datasets.last().map(|ds| ds.index.clone());

        for dataset in datasets {
            if Some(&dataset.index) != current.as_ref() {
                match self.manager.range_of(dataset).await {
                    Ok(range) if !range.contains(status.job_id) => continue,
                    Ok(_) => {}
                    Err(DatasetError::DatasetEmpty(_)) => continue,
                    Err(DatasetError::Store(StoreError::DatasetNotFound(_))) => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            match self.manager.store().append_status(dataset, status).await {
                Ok(AppendOutcome::Appended { status_id, workspace_id }) => {
                    debug!(dataset = %dataset, status_id, "status recorded");
                    return Ok(Some(RecordedStatus {
                        status_id,
                        workspace_id,
                        dataset: dataset.clone(),
                        job_state: status.job_state,
                    }));
                }
                Ok(AppendOutcome::Rejected { current }) => {
                    return Err(StatusError::InvalidTransition {
                        job_id: status.job_id,
                        from: current,
                        to: status.job_state,
                    });
                }
                // Dropped or migrated away since the listing.
                Ok(AppendOutcome::UnknownJob) | Err(StoreError::DatasetNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Keep only the most recent status rows of every job in `dataset`.
    pub async fn compact(&self, dataset: &Dataset) -> Result<u64, StatusError> {
        let removed = self
            .manager
            .store()
            .compact_statuses(dataset, KEEP_STATUSES_PER_JOB)
            .await?;
        debug!(dataset = %dataset, removed, "compacted status table");
        Ok(removed)
    }
}
