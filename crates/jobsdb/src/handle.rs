//! Access-mode scoped entry point to a queue.
//!
//! A `Handle<ReadOnly>` can only claim and inspect, a `Handle<WriteOnly>`
//! can only enqueue, and a `Handle<ReadWrite>` can do both plus report
//! statuses and run maintenance. The mode is checked at compile time.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use strata_core::{JobId, JobState, TenantId};
use strata_observability::ArchivalMetrics;
use strata_tenancy::MultiTenantScheduler;

use crate::backup::artifact::remove_stale_scratch;
use crate::backup::{ArchivalPipeline, ArchiveError, ArchiveOutcome, BlobUploader, PreBackupHandler};
use crate::config::{ConfigError, JobsDbConfig};
use crate::dataset::manager::Migration;
use crate::dataset::{Dataset, DatasetError, DatasetManager, DatasetRange};
use crate::job::{Job, NewJob, NewStatus};
use crate::journal::JournalError;
use crate::recovery::{self, RecoveryMode, RecoveryReport};
use crate::status::{RecordedStatus, StatusError, StatusTracker};
use crate::store::{JobStorage, PickupQuery, Retention, StoreError};

mod sealed {
    pub trait Sealed {}
}

/// What a handle may do; implemented only by the marker types below.
pub trait AccessMode: sealed::Sealed + std::fmt::Debug + Send + Sync + 'static {
    const READS: bool;
    const WRITES: bool;
}

/// Modes that may claim jobs.
pub trait Readable: AccessMode {}

/// Modes that may enqueue jobs.
pub trait Writable: AccessMode {}

#[derive(Debug, Clone, Copy)]
pub struct ReadOnly;

#[derive(Debug, Clone, Copy)]
pub struct WriteOnly;

#[derive(Debug, Clone, Copy)]
pub struct ReadWrite;

impl sealed::Sealed for ReadOnly {}
impl sealed::Sealed for WriteOnly {}
impl sealed::Sealed for ReadWrite {}

impl AccessMode for ReadOnly {
    const READS: bool = true;
    const WRITES: bool = false;
}

impl AccessMode for WriteOnly {
    const READS: bool = false;
    const WRITES: bool = true;
}

impl AccessMode for ReadWrite {
    const READS: bool = true;
    const WRITES: bool = true;
}

impl Readable for ReadOnly {}
impl Readable for ReadWrite {}
impl Writable for WriteOnly {}
impl Writable for ReadWrite {}

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Background loops started by `Handle::start`.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "background loop panicked");
            }
        }
    }
}

/// Collects the optional collaborators of a handle.
#[derive(Debug)]
pub struct HandleBuilder<M: AccessMode> {
    store: Arc<dyn JobStorage>,
    config: JobsDbConfig,
    uploader: Option<Arc<dyn BlobUploader>>,
    scheduler: Option<Arc<MultiTenantScheduler>>,
    hooks: Vec<Arc<dyn PreBackupHandler>>,
    metrics: Option<ArchivalMetrics>,
    _mode: PhantomData<M>,
}

impl<M: AccessMode> HandleBuilder<M> {
    /// Required for archival; without it the archival loop never starts.
    pub fn uploader(mut self, uploader: Arc<dyn BlobUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Share one scheduler between handles of the same process.
    pub fn scheduler(mut self, scheduler: Arc<MultiTenantScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn pre_backup(mut self, hook: Arc<dyn PreBackupHandler>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn metrics(mut self, metrics: ArchivalMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and bring the queue to a consistent state.
    ///
    /// Write-capable handles resolve the journal according to `mode`, drop
    /// leftover scratch artifacts and make sure a current dataset exists.
    #[instrument(skip(self), fields(prefix = %self.config.prefix), err)]
    pub async fn open(self, mode: RecoveryMode) -> Result<Handle<M>, HandleError> {
        self.config.validate()?;
        let config = self.config;

        let manager = Arc::new(DatasetManager::new(
            self.store,
            config.prefix.clone(),
            config.rotation.clone(),
        ));
        let tracker = StatusTracker::new(manager.clone(), config.max_attempts);
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(MultiTenantScheduler::from_config(&config.scheduler)));

        let mut recovered = RecoveryReport::default();
        if M::WRITES {
            if config.clear_db {
                manager.clear().await?;
            }
            if let Err(e) = remove_stale_scratch(&config.backup.scratch_dir, &config.prefix).await {
                warn!(dir = %config.backup.scratch_dir.display(), error = %e, "failed to clean scratch directory");
            }
            recovered = recovery::recover(&manager, mode).await?;
            manager.current_dataset().await?;
        }

        let pipeline = match (M::READS && M::WRITES, self.uploader) {
            (true, Some(uploader)) => {
                let pipeline = ArchivalPipeline::new(
                    manager.clone(),
                    tracker.clone(),
                    uploader,
                    config.backup.clone(),
                    config.settings.clone(),
                )
                .with_hooks(self.hooks)
                .with_metrics(self.metrics.unwrap_or_else(ArchivalMetrics::unregistered));
                Some(Arc::new(pipeline))
            }
            _ => None,
        };

        info!(
            prefix = %config.prefix,
            reads = M::READS,
            writes = M::WRITES,
            policy = scheduler.policy_name(),
            archival = pipeline.as_ref().is_some_and(|p| p.is_enabled()),
            recovered = recovered.resolved,
            "queue handle opened"
        );

        Ok(Handle {
            config,
            manager,
            tracker,
            scheduler,
            pipeline,
            _mode: PhantomData,
        })
    }
}

#[derive(Debug)]
pub struct Handle<M: AccessMode> {
    config: JobsDbConfig,
    manager: Arc<DatasetManager>,
    tracker: StatusTracker,
    scheduler: Arc<MultiTenantScheduler>,
    pipeline: Option<Arc<ArchivalPipeline>>,
    _mode: PhantomData<M>,
}

impl<M: AccessMode> Handle<M> {
    pub fn builder(store: Arc<dyn JobStorage>, config: JobsDbConfig) -> HandleBuilder<M> {
        HandleBuilder {
            store,
            config,
            uploader: None,
            scheduler: None,
            hooks: Vec::new(),
            metrics: None,
            _mode: PhantomData,
        }
    }

    pub fn config(&self) -> &JobsDbConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<MultiTenantScheduler> {
        &self.scheduler
    }

    /// Start the loops this mode runs: rotation for writers, archival for
    /// read-write handles with an uploader.
    pub fn start(&self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let mut joins = Vec::new();

        if M::WRITES {
            joins.push(tokio::spawn(self.manager.clone().run_rotation(cancel.clone())));
        }
        if let Some(pipeline) = &self.pipeline {
            joins.push(tokio::spawn(pipeline.clone().run(cancel.clone())));
        }

        WorkerHandle { cancel, joins }
    }
}

impl<M: Readable> Handle<M> {
    /// Claim up to `limit` pickable jobs for `pool`, ordered by job id.
    ///
    /// Pending counts are reseeded from the store, the scheduler divides
    /// `limit` between tenants, and each tenant's share is filled from the
    /// oldest datasets first. Claiming does not change job state; consumers
    /// report `executing` once they start.
    #[instrument(skip(self), fields(prefix = %self.config.prefix), err)]
    pub async fn claim(&self, pool: &str, limit: usize) -> Result<Vec<Job>, HandleError> {
        let now = Utc::now();
        let mut datasets = self.manager.list_datasets().await?;
        if let Some(ds_limit) = self.config.ds_limit {
            datasets.truncate(ds_limit);
        }

        let store = self.manager.store();
        let mut pending: HashMap<TenantId, u64> = HashMap::new();
        for dataset in &datasets {
            match store.pending_counts(dataset, now).await {
                Ok(counts) => {
                    for (tenant, count) in counts {
                        *pending.entry(tenant).or_default() += count;
                    }
                }
                // Dropped by archival since the listing.
                Err(StoreError::DatasetNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.scheduler.set_pending(pool, &pending);

        let allocation = self.scheduler.pickup_allocation(
            pool,
            limit,
            self.config.scheduler.window,
            self.config.scheduler.min_per_tenant,
        );
        let mut shares: Vec<(TenantId, usize)> = allocation.into_iter().filter(|(_, n)| *n > 0).collect();
        shares.sort();

        let mut jobs = Vec::new();
        for (tenant, share) in shares {
            let mut remaining = share;
            for dataset in &datasets {
                if remaining == 0 {
                    break;
                }
                let query = PickupQuery {
                    tenant,
                    limit: remaining,
                    now,
                };
                match store.pickable_jobs(dataset, &query).await {
                    Ok(found) => {
                        remaining = remaining.saturating_sub(found.len());
                        jobs.extend(found);
                    }
                    Err(StoreError::DatasetNotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        jobs.sort_by_key(|job| job.job_id);

        debug!(pool, claimed = jobs.len(), limit, "claimed jobs");
        Ok(jobs)
    }

    pub async fn list_datasets(&self) -> Result<Vec<Dataset>, HandleError> {
        Ok(self.manager.list_datasets().await?)
    }

    /// Ranges of every non-empty dataset, oldest first.
    pub async fn dataset_ranges(&self) -> Result<Vec<DatasetRange>, HandleError> {
        let mut ranges = Vec::new();
        for dataset in self.manager.list_datasets().await? {
            match self.manager.range_of(&dataset).await {
                Ok(range) => ranges.push(range),
                Err(DatasetError::DatasetEmpty(_)) => {}
                Err(DatasetError::Store(StoreError::DatasetNotFound(_))) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ranges)
    }

    /// The dataset archival would pick next, if any.
    pub async fn oldest_archivable(&self) -> Result<Option<DatasetRange>, HandleError> {
        let datasets = self.manager.list_datasets().await?;
        let Some((_, older)) = datasets.split_last() else {
            return Ok(None);
        };
        for dataset in older {
            match self.manager.range_of(dataset).await {
                Ok(range) => return Ok(Some(range)),
                Err(DatasetError::DatasetEmpty(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

impl<M: Writable> Handle<M> {
    /// Append jobs to the current dataset; ids follow input order.
    pub async fn enqueue(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, HandleError> {
        let ids = self.manager.write_jobs(&jobs).await?;

        let mut added: HashMap<TenantId, u64> = HashMap::new();
        for job in &jobs {
            *added.entry(job.workspace_id).or_default() += 1;
        }
        for pool in self.scheduler.pool_names() {
            self.scheduler.report_pending(&pool, &added);
        }
        Ok(ids)
    }
}

impl Handle<ReadWrite> {
    /// Record a status reported by a consumer of `pool`.
    pub async fn report_status(&self, pool: &str, status: NewStatus) -> Result<RecordedStatus, HandleError> {
        let recorded = self.tracker.record_status(status).await?;
        match recorded.job_state {
            JobState::Succeeded => {
                self.scheduler
                    .record_outcome(recorded.workspace_id, pool, true, false)
            }
            JobState::Failed | JobState::Aborted => {
                self.scheduler
                    .record_outcome(recorded.workspace_id, pool, false, true)
            }
            _ => {}
        }
        Ok(recorded)
    }

    pub async fn compact(&self, dataset: &Dataset) -> Result<u64, HandleError> {
        Ok(self.tracker.compact(dataset).await?)
    }

    /// Move the unfinished jobs of a non-current dataset out of it. In
    /// failed-only queues failed jobs stay behind for archival.
    pub async fn migrate(&self, dataset: &Dataset) -> Result<Migration, HandleError> {
        let retention = Retention::for_failed_only(self.config.settings.failed_only);
        Ok(self.manager.migrate(dataset, retention).await?)
    }

    pub async fn rotate(&self) -> Result<Dataset, HandleError> {
        Ok(self.manager.rotate().await?)
    }

    /// Run a single archival cycle in the caller's task.
    pub async fn archive_once(&self, cancel: &CancellationToken) -> Result<ArchiveOutcome, HandleError> {
        match &self.pipeline {
            Some(pipeline) => Ok(pipeline.run_once(cancel).await?),
            None => Ok(ArchiveOutcome::Disabled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupSettings;
    use crate::store::InMemoryJobStorage;
    use serde_json::json;

    fn store() -> Arc<dyn JobStorage> {
        Arc::new(InMemoryJobStorage::new())
    }

    #[tokio::test]
    async fn invalid_prefix_is_rejected() {
        let result = Handle::<ReadWrite>::builder(store(), JobsDbConfig::new("Bad-Prefix"))
            .open(RecoveryMode::Normal)
            .await;
        assert!(matches!(result, Err(HandleError::Config(ConfigError::InvalidPrefix(_)))));
    }

    #[tokio::test]
    async fn writer_creates_first_dataset_reader_does_not() {
        let store = store();
        let reader = Handle::<ReadOnly>::builder(store.clone(), JobsDbConfig::new("rt"))
            .open(RecoveryMode::Normal)
            .await
            .unwrap();
        assert!(reader.list_datasets().await.unwrap().is_empty());
        assert!(reader.claim("router", 10).await.unwrap().is_empty());

        Handle::<WriteOnly>::builder(store, JobsDbConfig::new("rt"))
            .open(RecoveryMode::Normal)
            .await
            .unwrap();
        assert_eq!(reader.list_datasets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claims_are_ordered_and_respect_tenant_shares() {
        let handle = Handle::<ReadWrite>::builder(store(), JobsDbConfig::new("rt"))
            .open(RecoveryMode::Normal)
            .await
            .unwrap();
        let (a, b) = (TenantId::new(), TenantId::new());
        let mut jobs = Vec::new();
        for i in 0..6 {
            let tenant = if i % 2 == 0 { a } else { b };
            jobs.push(NewJob::new(tenant, "WEBHOOK", json!({ "i": i })));
        }
        let ids = handle.enqueue(jobs).await.unwrap();

        let claimed = handle.claim("router", 100).await.unwrap();
        let claimed_ids: Vec<JobId> = claimed.iter().map(|j| j.job_id).collect();
        assert_eq!(claimed_ids, ids);

        let limited = handle.claim("router", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert!(limited[0].job_id < limited[1].job_id);
    }

    #[tokio::test]
    async fn reported_statuses_feed_the_scheduler() {
        let handle = Handle::<ReadWrite>::builder(store(), JobsDbConfig::new("rt"))
            .open(RecoveryMode::Normal)
            .await
            .unwrap();
        let tenant = TenantId::new();
        let ids = handle
            .enqueue(vec![NewJob::new(tenant, "WEBHOOK", json!({}))])
            .await
            .unwrap();
        handle.claim("router", 10).await.unwrap();

        handle
            .report_status("router", NewStatus::new(ids[0], JobState::Executing, 1))
            .await
            .unwrap();
        handle
            .report_status("router", NewStatus::new(ids[0], JobState::Succeeded, 1))
            .await
            .unwrap();

        let snapshot = handle.scheduler().snapshot("router");
        assert_eq!(snapshot[0].pending, 0);
        assert!(handle.claim("router", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ds_limit_bounds_claimed_datasets() {
        let handle = Handle::<ReadWrite>::builder(store(), JobsDbConfig::new("rt").with_ds_limit(1))
            .open(RecoveryMode::Normal)
            .await
            .unwrap();
        let tenant = TenantId::new();
        let first = handle
            .enqueue(vec![NewJob::new(tenant, "WEBHOOK", json!({}))])
            .await
            .unwrap();
        handle.rotate().await.unwrap();
        handle
            .enqueue(vec![NewJob::new(tenant, "WEBHOOK", json!({}))])
            .await
            .unwrap();

        let claimed = handle.claim("router", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job_id, first[0]);
    }

    #[tokio::test]
    async fn archive_once_without_uploader_is_disabled() {
        let config = JobsDbConfig::new("rt").with_settings(BackupSettings::enabled());
        let handle = Handle::<ReadWrite>::builder(store(), config)
            .open(RecoveryMode::Normal)
            .await
            .unwrap();
        let outcome = handle.archive_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ArchiveOutcome::Disabled);
    }

    #[tokio::test]
    async fn clear_db_drops_existing_datasets() {
        let store = store();
        let handle = Handle::<ReadWrite>::builder(store.clone(), JobsDbConfig::new("rt"))
            .open(RecoveryMode::Normal)
            .await
            .unwrap();
        handle
            .enqueue(vec![NewJob::new(TenantId::new(), "WEBHOOK", json!({}))])
            .await
            .unwrap();
        handle.rotate().await.unwrap();

        let cleared = Handle::<ReadWrite>::builder(store, JobsDbConfig::new("rt").with_clear_db(true))
            .open(RecoveryMode::Normal)
            .await
            .unwrap();
        let datasets = cleared.list_datasets().await.unwrap();
        assert_eq!(datasets.len(), 1);
        assert!(cleared.dataset_ranges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn started_loops_stop_on_shutdown() {
        let handle = Handle::<ReadWrite>::builder(store(), JobsDbConfig::new("rt"))
            .uploader(Arc::new(crate::backup::LocalDirUploader::new(std::env::temp_dir())))
            .open(RecoveryMode::Normal)
            .await
            .unwrap();
        let workers = handle.start();
        workers.shutdown().await;
    }
}
