//! Datasets: the physical partitions of a queue.
//!
//! Each dataset is a job table plus a status table. New jobs always land in
//! the current dataset (the one with the greatest index); older datasets are
//! read-only and are archived then dropped, oldest first.

pub mod index;
pub mod manager;

use serde::{Deserialize, Serialize};
use strata_core::JobId;

use crate::journal::JournalError;
use crate::store::StoreError;

pub use index::DatasetIndex;
pub use manager::{DatasetManager, Migration};

/// A partition of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dataset {
    pub prefix: String,
    pub index: DatasetIndex,
    pub job_table: String,
    pub status_table: String,
}

impl Dataset {
    pub fn new(prefix: &str, index: DatasetIndex) -> Self {
        Self {
            prefix: prefix.to_string(),
            job_table: format!("{prefix}_jobs_{index}"),
            status_table: format!("{prefix}_job_status_{index}"),
            index,
        }
    }

    /// Parse a catalog table name such as `rt_jobs_1_1`.
    pub fn from_job_table(prefix: &str, table: &str) -> Option<Self> {
        let index = table
            .strip_prefix(prefix)?
            .strip_prefix("_jobs_")?
            .parse()
            .ok()?;
        Some(Self::new(prefix, index))
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.prefix, self.index)
    }
}

/// Id and creation-time bounds of a non-empty dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRange {
    pub min_job_id: JobId,
    pub max_job_id: JobId,
    /// Epoch milliseconds.
    pub start_ms: i64,
    pub end_ms: i64,
    pub dataset: Dataset,
}

impl DatasetRange {
    pub fn contains(&self, job_id: JobId) -> bool {
        self.min_job_id <= job_id && job_id <= self.max_job_id
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DatasetError {
    /// Not an error for schedulers: the dataset is simply not archivable yet.
    #[error("dataset {0} is empty")]
    DatasetEmpty(Dataset),
    #[error("no free dataset index after {0}")]
    NoIntermediateIndex(Dataset),
    #[error("refusing to {action} the current dataset {dataset}")]
    CurrentDataset { action: &'static str, dataset: Dataset },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_follow_prefix_and_index() {
        let ds = Dataset::new("rt", "1_2".parse().unwrap());
        assert_eq!(ds.job_table, "rt_jobs_1_2");
        assert_eq!(ds.status_table, "rt_job_status_1_2");
        assert_eq!(ds.to_string(), "rt:1_2");
    }

    #[test]
    fn parses_catalog_names_for_own_prefix_only() {
        let ds = Dataset::from_job_table("rt", "rt_jobs_3").unwrap();
        assert_eq!(ds.index.to_string(), "3");

        assert!(Dataset::from_job_table("rt", "batch_rt_jobs_3").is_none());
        assert!(Dataset::from_job_table("rt", "rt_job_status_3").is_none());
        assert!(Dataset::from_job_table("rt", "rt_jobs_x").is_none());
    }
}
