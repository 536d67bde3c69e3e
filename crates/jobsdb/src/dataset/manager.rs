use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock as AsyncRwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use strata_core::JobId;

use super::{Dataset, DatasetError, DatasetIndex, DatasetRange};
use crate::config::RotationConfig;
use crate::job::NewJob;
use crate::journal::{Journal, JournalOp};
use crate::store::{JobStorage, Retention};

/// Result of moving a dataset's unfinished jobs into an intermediate one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub from: Dataset,
    pub to: Dataset,
    pub moved: u64,
}

/// Owns the ordered datasets of one queue.
///
/// The dataset list is re-read from the store on every call; only ranges of
/// non-current datasets are cached, since nothing is inserted into them.
#[derive(Debug)]
pub struct DatasetManager {
    store: Arc<dyn JobStorage>,
    prefix: String,
    rotation: RotationConfig,
    journal: Journal,
    range_cache: RwLock<HashMap<DatasetIndex, DatasetRange>>,
    /// Serializes dataset creation.
    rotate_lock: Mutex<()>,
    /// Held shared by inserts and exclusively by rotation, so an insert
    /// finishes against the dataset it resolved before a new one becomes
    /// current.
    writers: AsyncRwLock<()>,
}

impl DatasetManager {
    pub fn new(store: Arc<dyn JobStorage>, prefix: impl Into<String>, rotation: RotationConfig) -> Self {
        let prefix = prefix.into();
        Self {
            journal: Journal::new(store.clone(), prefix.clone()),
            store,
            prefix,
            rotation,
            range_cache: RwLock::new(HashMap::new()),
            rotate_lock: Mutex::new(()),
            writers: AsyncRwLock::new(()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &Arc<dyn JobStorage> {
        &self.store
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// All datasets, oldest first.
    pub async fn list_datasets(&self) -> Result<Vec<Dataset>, DatasetError> {
        let mut datasets = self.store.list_datasets(&self.prefix).await?;
        datasets.sort_by(|a, b| a.index.cmp(&b.index));
        Ok(datasets)
    }

    /// The dataset new jobs are written to, created if the queue has none.
    pub async fn current_dataset(&self) -> Result<Dataset, DatasetError> {
        if let Some(current) = self.list_datasets().await?.pop() {
            return Ok(current);
        }

        let _guard = self.rotate_lock.lock().await;
        if let Some(current) = self.list_datasets().await?.pop() {
            return Ok(current);
        }
        let first = Dataset::new(&self.prefix, DatasetIndex::first());
        self.store.create_dataset(&first).await?;
        info!(dataset = %first, "created first dataset");
        Ok(first)
    }

    /// Id and time bounds of `dataset`; `DatasetEmpty` when it has no jobs.
    pub async fn range_of(&self, dataset: &Dataset) -> Result<DatasetRange, DatasetError> {
        if let Some(range) = self.cached_range(&dataset.index) {
            return Ok(range);
        }

        let raw = self
            .store
            .job_range(dataset)
            .await?
            .ok_or_else(|| DatasetError::DatasetEmpty(dataset.clone()))?;
        let range = DatasetRange {
            min_job_id: raw.min_job_id,
            max_job_id: raw.max_job_id,
            start_ms: raw.min_created_at.timestamp_millis(),
            end_ms: raw.max_created_at.timestamp_millis(),
            dataset: dataset.clone(),
        };

        let is_current = self
            .list_datasets()
            .await?
            .last()
            .is_some_and(|current| current.index == dataset.index);
        if !is_current {
            self.range_cache
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(dataset.index.clone(), range.clone());
        }
        Ok(range)
    }

    /// Cached range of a non-current dataset, if it has been computed.
    pub(crate) fn cached_range(&self, index: &DatasetIndex) -> Option<DatasetRange> {
        self.range_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    pub fn invalidate_range(&self, dataset: &Dataset) {
        self.range_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&dataset.index);
    }

    /// Insert jobs into the current dataset.
    #[instrument(skip(self, jobs), fields(prefix = %self.prefix, count = jobs.len()), err)]
    pub async fn write_jobs(&self, jobs: &[NewJob]) -> Result<Vec<JobId>, DatasetError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let _writer = self.writers.read().await;
        let current = self.current_dataset().await?;
        let ids = self.store.insert_jobs(&current, jobs).await?;
        debug!(dataset = %current, count = ids.len(), "jobs written");
        Ok(ids)
    }

    /// Make a new top-level dataset current.
    pub async fn rotate(&self) -> Result<Dataset, DatasetError> {
        let _writers = self.writers.write().await;
        let _guard = self.rotate_lock.lock().await;
        self.rotate_locked().await
    }

    async fn rotate_locked(&self) -> Result<Dataset, DatasetError> {
        let current = match self.list_datasets().await?.pop() {
            Some(current) => current,
            None => {
                let first = Dataset::new(&self.prefix, DatasetIndex::first());
                self.store.create_dataset(&first).await?;
                first
            }
        };
        let next = Dataset::new(&self.prefix, current.index.next_top());
        self.store.create_dataset(&next).await?;
        // The previous current dataset becomes cacheable.
        self.range_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(from = %current, to = %next, "rotated dataset");
        Ok(next)
    }

    async fn needs_rotation(&self, current: &Dataset) -> Result<bool, DatasetError> {
        let count = self.store.count_jobs(current).await?;
        if count >= self.rotation.max_ds_rows {
            return Ok(true);
        }
        let Some(raw) = self.store.job_range(current).await? else {
            return Ok(false);
        };
        let age = Utc::now().signed_duration_since(raw.min_created_at);
        Ok(age.to_std().is_ok_and(|age| age >= self.rotation.max_ds_age))
    }

    /// Rotate when the current dataset is over its size or age threshold.
    pub async fn rotate_if_needed(&self) -> Result<Option<Dataset>, DatasetError> {
        let current = self.current_dataset().await?;
        if !self.needs_rotation(&current).await? {
            return Ok(None);
        }

        let _writers = self.writers.write().await;
        let _guard = self.rotate_lock.lock().await;
        // Another task may have rotated (or cleared) while we waited.
        let Some(current) = self.list_datasets().await?.pop() else {
            return Ok(None);
        };
        if !self.needs_rotation(&current).await? {
            return Ok(None);
        }
        self.rotate_locked().await.map(Some)
    }

    /// Move the jobs `retention` counts as unfinished out of a non-current
    /// dataset into a new dataset placed right after it, so the source can
    /// be archived.
    #[instrument(skip(self, dataset), fields(dataset = %dataset), err)]
    pub async fn migrate(&self, dataset: &Dataset, retention: Retention) -> Result<Migration, DatasetError> {
        let datasets = self.list_datasets().await?;
        let position = datasets.iter().position(|ds| ds.index == dataset.index);
        let next = position.and_then(|i| datasets.get(i + 1));
        if position.is_some() && next.is_none() {
            return Err(DatasetError::CurrentDataset {
                action: "migrate",
                dataset: dataset.clone(),
            });
        }

        let to_index = dataset
            .index
            .between(next.map(|ds| &ds.index))
            .ok_or_else(|| DatasetError::NoIntermediateIndex(dataset.clone()))?;
        let to = Dataset::new(&self.prefix, to_index);

        let op = JournalOp::MigrateDatasets {
            from: vec![dataset.clone()],
            to: to.clone(),
        };
        let entry = self.journal.mark_start(&op).await?;
        let moved = self.store.migrate_unfinished(dataset, &to, retention).await?;
        self.invalidate_range(dataset);
        self.journal.mark_done(entry).await?;

        info!(from = %dataset, to = %to, moved, "migrated unfinished jobs");
        Ok(Migration {
            from: dataset.clone(),
            to,
            moved,
        })
    }

    /// Drop a dataset's tables; dropping a missing dataset is a no-op.
    pub async fn drop_dataset(&self, dataset: &Dataset) -> Result<(), DatasetError> {
        self.store.drop_dataset(dataset).await?;
        self.invalidate_range(dataset);
        info!(dataset = %dataset, "dropped dataset");
        Ok(())
    }

    /// Drop every dataset of the queue.
    pub async fn clear(&self) -> Result<usize, DatasetError> {
        let _writers = self.writers.write().await;
        let datasets = self.list_datasets().await?;
        for dataset in &datasets {
            self.drop_dataset(dataset).await?;
        }
        warn!(prefix = %self.prefix, dropped = datasets.len(), "cleared all datasets");
        Ok(datasets.len())
    }

    /// Check the rotation thresholds every `check_interval` until cancelled.
    pub async fn run_rotation(self: Arc<Self>, cancel: CancellationToken) {
        info!(prefix = %self.prefix, "rotation loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.rotation.check_interval) => {}
            }
            if let Err(e) = self.rotate_if_needed().await {
                warn!(prefix = %self.prefix, error = %e, "rotation check failed");
            }
        }
        info!(prefix = %self.prefix, "rotation loop stopped");
    }
}
