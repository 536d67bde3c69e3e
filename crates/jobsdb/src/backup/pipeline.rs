//! The archival cycle of one queue.
//!
//! The journal protocol is `start(backup) -> export + upload -> done(backup)
//! -> start(drop) -> drop -> done(drop)`. Any failure before the drop leaves
//! the backup entry in the journal and the dataset in place.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use strata_observability::ArchivalMetrics;

use super::artifact::{ArtifactWriter, failed_only_artifact_name, jobs_artifact_name, status_artifact_name};
use super::export::export_rows;
use super::hooks::PreBackupHandler;
use super::retry::{RetryError, retry};
use super::upload::{BlobUploader, UploadOutput};
use super::ArchiveError;
use crate::config::{BackupConfig, BackupSettings};
use crate::dataset::{Dataset, DatasetError, DatasetManager, DatasetRange};
use crate::dataset::manager::Migration;
use crate::journal::JournalOp;
use crate::status::StatusTracker;
use crate::store::{ExportMode, Retention};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// Archival is switched off for this queue.
    Disabled,
    /// No non-current dataset holds jobs.
    Idle,
    Archived {
        dataset: Dataset,
        /// Unfinished jobs moved out before export, if any.
        migration: Option<Migration>,
        artifacts: Vec<UploadOutput>,
    },
}

#[derive(Debug)]
pub struct ArchivalPipeline {
    manager: Arc<DatasetManager>,
    tracker: StatusTracker,
    uploader: Arc<dyn BlobUploader>,
    backup: BackupConfig,
    settings: BackupSettings,
    hooks: Vec<Arc<dyn PreBackupHandler>>,
    metrics: ArchivalMetrics,
}

impl ArchivalPipeline {
    pub fn new(
        manager: Arc<DatasetManager>,
        tracker: StatusTracker,
        uploader: Arc<dyn BlobUploader>,
        backup: BackupConfig,
        settings: BackupSettings,
    ) -> Self {
        Self {
            manager,
            tracker,
            uploader,
            backup,
            settings,
            hooks: Vec::new(),
            metrics: ArchivalMetrics::unregistered(),
        }
    }

    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn PreBackupHandler>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_metrics(mut self, metrics: ArchivalMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    fn queue(&self) -> &str {
        self.manager.prefix()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.is_enabled(&self.backup)
    }

    fn retention(&self) -> Retention {
        Retention::for_failed_only(self.settings.failed_only)
    }

    /// Range of the oldest non-current dataset with jobs to archive.
    pub async fn select_archivable(&self) -> Result<Option<DatasetRange>, DatasetError> {
        Ok(self.next_candidate().await?.map(|(range, _)| range))
    }

    /// The oldest non-current dataset holding at least one settled job,
    /// with its count of unfinished jobs. Datasets holding only unfinished
    /// jobs are skipped until some of their jobs settle.
    async fn next_candidate(&self) -> Result<Option<(DatasetRange, u64)>, DatasetError> {
        let datasets = self.manager.list_datasets().await?;
        let candidates = datasets.split_last().map_or(&[][..], |(_, older)| older);
        self.metrics.set_pre_drop_datasets(self.queue(), candidates.len());

        let store = self.manager.store();
        for dataset in candidates {
            let range = match self.manager.range_of(dataset).await {
                Ok(range) => range,
                Err(DatasetError::DatasetEmpty(_)) => continue,
                Err(e) => return Err(e),
            };
            let unfinished = store.count_unfinished(dataset, self.retention()).await?;
            if unfinished >= store.count_jobs(dataset).await? {
                debug!(dataset = %dataset, unfinished, "only unfinished jobs, nothing to archive yet");
                continue;
            }
            return Ok(Some((range, unfinished)));
        }
        Ok(None)
    }

    /// One archival cycle: select, migrate unfinished jobs away, archive.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<ArchiveOutcome, ArchiveError> {
        if !self.is_enabled() {
            return Ok(ArchiveOutcome::Disabled);
        }
        let Some((range, unfinished)) = self.next_candidate().await? else {
            return Ok(ArchiveOutcome::Idle);
        };
        let dataset = range.dataset;

        let migration = if unfinished > 0 {
            Some(self.manager.migrate(&dataset, self.retention()).await?)
        } else {
            None
        };

        let artifacts = self.archive(&dataset, cancel).await?;
        Ok(ArchiveOutcome::Archived {
            dataset,
            migration,
            artifacts,
        })
    }

    /// Export, upload, then drop `dataset`.
    #[instrument(skip(self, dataset, cancel), fields(dataset = %dataset), err)]
    pub async fn archive(
        &self,
        dataset: &Dataset,
        cancel: &CancellationToken,
    ) -> Result<Vec<UploadOutput>, ArchiveError> {
        let started = Instant::now();
        match self.archive_inner(dataset, cancel).await {
            Ok(artifacts) => {
                self.metrics.observe_total_dump(self.queue(), started.elapsed());
                info!(dataset = %dataset, artifacts = artifacts.len(), "dataset archived and dropped");
                Ok(artifacts)
            }
            Err(ArchiveError::Cancelled) => {
                info!(dataset = %dataset, "archival cancelled");
                Err(ArchiveError::Cancelled)
            }
            Err(e) => {
                self.metrics
                    .backup_failed(self.queue(), &self.backup.storage_provider);
                Err(e)
            }
        }
    }

    async fn archive_inner(
        &self,
        dataset: &Dataset,
        cancel: &CancellationToken,
    ) -> Result<Vec<UploadOutput>, ArchiveError> {
        let journal = self.manager.journal();

        let backup_entry = journal
            .resume_or_start(&JournalOp::BackupDataset {
                dataset: dataset.clone(),
            })
            .await?;
        let artifacts = self.export_and_upload(dataset, cancel).await?;
        journal.mark_done(backup_entry).await?;

        let drop_entry = journal
            .mark_start(&JournalOp::DropDataset {
                dataset: dataset.clone(),
            })
            .await?;
        self.manager.drop_dataset(dataset).await?;
        journal.mark_done(drop_entry).await?;

        Ok(artifacts)
    }

    async fn export_and_upload(
        &self,
        dataset: &Dataset,
        cancel: &CancellationToken,
    ) -> Result<Vec<UploadOutput>, ArchiveError> {
        self.tracker.compact(dataset).await?;
        for hook in &self.hooks {
            hook.handle(self.manager.store().as_ref(), dataset)
                .await
                .map_err(|e| ArchiveError::Hook {
                    handler: hook.name().to_string(),
                    reason: e.to_string(),
                })?;
        }

        // Hooks may have deleted jobs.
        self.manager.invalidate_range(dataset);
        let range = match self.manager.range_of(dataset).await {
            Ok(range) => range,
            Err(DatasetError::DatasetEmpty(_)) => {
                debug!(dataset = %dataset, "nothing left to export");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let exports = if self.settings.failed_only {
            vec![(ExportMode::FailedOnly, failed_only_artifact_name(dataset))]
        } else {
            vec![
                (ExportMode::Complete, jobs_artifact_name(&range)),
                (ExportMode::StatusOnly, status_artifact_name(dataset)),
            ]
        };

        let mut uploaded = Vec::with_capacity(exports.len());
        for (mode, name) in exports {
            if let Some(output) = self.export_and_upload_one(dataset, mode, &name, cancel).await? {
                uploaded.push(output);
            }
        }
        Ok(uploaded)
    }

    /// `None` when the export produced no rows.
    async fn export_and_upload_one(
        &self,
        dataset: &Dataset,
        mode: ExportMode,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<UploadOutput>, ArchiveError> {
        let dump_started = Instant::now();
        let path = self.backup.scratch_dir.join(name);
        let mut writer = ArtifactWriter::create(&path)
            .map_err(|e| ArchiveError::ExportFailure(format!("creating {}: {e}", path.display())))?;
        let rows = export_rows(
            self.manager.store().as_ref(),
            dataset,
            mode,
            self.backup.batch_rows,
            self.backup.max_payload_bytes,
            &mut writer,
            cancel,
        )
        .await?;
        let file = writer
            .finish()
            .map_err(|e| ArchiveError::ExportFailure(format!("finishing {}: {e}", path.display())))?;
        self.metrics.observe_table_dump(self.queue(), dump_started.elapsed());

        if rows == 0 {
            debug!(dataset = %dataset, mode = mode.as_str(), "empty export, skipping upload");
            return Ok(None);
        }

        let upload_started = Instant::now();
        let prefixes = self.settings.upload_prefixes(&self.backup);
        let (uploader, file_path, prefixes) = (&self.uploader, file.path(), &prefixes);
        let output = retry(&self.backup.backoff, cancel, move |_| {
            uploader.upload(file_path, prefixes)
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, last } => ArchiveError::UploadFailure {
                attempts,
                reason: last.to_string(),
            },
            RetryError::Cancelled => ArchiveError::Cancelled,
        })?;
        self.metrics.observe_file_upload(self.queue(), upload_started.elapsed());

        debug!(dataset = %dataset, mode = mode.as_str(), rows, location = %output.location, "artifact uploaded");
        Ok(Some(output))
    }

    /// Archive until cancelled, sleeping longer while nothing is archivable.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(queue = self.queue(), enabled = self.is_enabled(), "archival loop started");
        let interval = self.backup.check_interval;
        let idle_interval = interval * self.backup.empty_sleep_multiplier;

        loop {
            let sleep = match self.run_once(&cancel).await {
                Ok(ArchiveOutcome::Archived { .. }) => interval,
                Ok(ArchiveOutcome::Idle | ArchiveOutcome::Disabled) => idle_interval,
                Err(ArchiveError::Cancelled) => break,
                Err(e) => {
                    warn!(queue = self.queue(), error = %e, "archival cycle failed");
                    interval
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!(queue = self.queue(), "archival loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::upload::{LocalDirUploader, UploadError};
    use crate::config::RotationConfig;
    use crate::job::{NewJob, NewStatus};
    use crate::store::{InMemoryJobStorage, JobStorage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use strata_core::{JobState, TenantId};

    #[derive(Debug)]
    struct FailingUploader;

    #[async_trait]
    impl BlobUploader for FailingUploader {
        fn provider(&self) -> &str {
            "S3"
        }

        async fn upload(&self, _: &Path, _: &[String]) -> Result<UploadOutput, UploadError> {
            Err(UploadError::Rejected("bucket unavailable".into()))
        }
    }

    struct Fixture {
        manager: Arc<DatasetManager>,
        scratch: tempfile::TempDir,
        remote: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let manager = Arc::new(DatasetManager::new(
                Arc::new(InMemoryJobStorage::new()),
                "rt",
                RotationConfig::default(),
            ));
            Self {
                manager,
                scratch: tempfile::tempdir().unwrap(),
                remote: tempfile::tempdir().unwrap(),
            }
        }

        fn backup(&self) -> BackupConfig {
            BackupConfig {
                bucket: "archive".into(),
                scratch_dir: self.scratch.path().to_path_buf(),
                backoff: BackupConfig::default()
                    .backoff
                    .with_max_elapsed_time(std::time::Duration::from_secs(2)),
                ..BackupConfig::default()
            }
        }

        fn pipeline(&self, uploader: Arc<dyn BlobUploader>, settings: BackupSettings) -> ArchivalPipeline {
            ArchivalPipeline::new(
                self.manager.clone(),
                StatusTracker::new(self.manager.clone(), 5),
                uploader,
                self.backup(),
                settings,
            )
        }

        fn local(&self) -> Arc<dyn BlobUploader> {
            Arc::new(LocalDirUploader::new(self.remote.path()))
        }

        async fn finished_dataset(&self, n: usize) -> Dataset {
            let tenant = TenantId::new();
            let jobs: Vec<NewJob> = (0..n)
                .map(|i| NewJob::new(tenant, "WEBHOOK", json!({ "i": i })))
                .collect();
            let ids = self.manager.write_jobs(&jobs).await.unwrap();
            let dataset = self.manager.current_dataset().await.unwrap();
            for id in ids {
                for state in [JobState::Executing, JobState::Succeeded] {
                    self.manager
                        .store()
                        .append_status(&dataset, &NewStatus::new(id, state, 1))
                        .await
                        .unwrap();
                }
            }
            self.manager.rotate().await.unwrap();
            dataset
        }
    }

    #[tokio::test]
    async fn disabled_without_bucket_or_instance_flag() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(fx.local(), BackupSettings::default());
        assert!(!pipeline.is_enabled());
        let outcome = pipeline.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ArchiveOutcome::Disabled);
    }

    #[tokio::test]
    async fn current_dataset_is_never_selected() {
        let fx = Fixture::new();
        fx.manager
            .write_jobs(&[NewJob::new(TenantId::new(), "WEBHOOK", json!({}))])
            .await
            .unwrap();
        let pipeline = fx.pipeline(fx.local(), BackupSettings::enabled());
        assert!(pipeline.select_archivable().await.unwrap().is_none());
        assert_eq!(
            pipeline.run_once(&CancellationToken::new()).await.unwrap(),
            ArchiveOutcome::Idle
        );
    }

    #[tokio::test]
    async fn complete_archive_uploads_jobs_and_statuses_then_drops() {
        let fx = Fixture::new();
        let dataset = fx.finished_dataset(3).await;
        let pipeline = fx.pipeline(fx.local(), BackupSettings::enabled());

        let outcome = pipeline.run_once(&CancellationToken::new()).await.unwrap();
        let ArchiveOutcome::Archived { dataset: archived, migration, artifacts } = outcome else {
            panic!("expected an archived dataset");
        };
        assert_eq!(archived, dataset);
        assert!(migration.is_none());
        assert_eq!(artifacts.len(), 2);
        assert!(artifacts[0].location.contains("rt_jobs_1.1.3."));
        assert!(artifacts[1].location.ends_with("rt_job_status_1.gz"));

        let remaining = fx.manager.list_datasets().await.unwrap();
        assert!(remaining.iter().all(|ds| ds.index != dataset.index));
        assert!(fx.manager.journal().recover_incomplete().await.unwrap().next().is_none());
        assert_eq!(std::fs::read_dir(fx.scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unfinished_jobs_are_migrated_before_archival() {
        let fx = Fixture::new();
        let tenant = TenantId::new();
        let ids = fx
            .manager
            .write_jobs(&[
                NewJob::new(tenant, "WEBHOOK", json!({})),
                NewJob::new(tenant, "WEBHOOK", json!({})),
            ])
            .await
            .unwrap();
        let source = fx.manager.current_dataset().await.unwrap();
        for state in [JobState::Executing, JobState::Succeeded] {
            fx.manager
                .store()
                .append_status(&source, &NewStatus::new(ids[0], state, 1))
                .await
                .unwrap();
        }
        fx.manager.rotate().await.unwrap();

        let pipeline = fx.pipeline(fx.local(), BackupSettings::enabled());
        let outcome = pipeline.run_once(&CancellationToken::new()).await.unwrap();
        let ArchiveOutcome::Archived { migration: Some(migration), .. } = outcome else {
            panic!("expected a migration");
        };
        assert_eq!(migration.moved, 1);

        let order: Vec<String> = fx
            .manager
            .list_datasets()
            .await
            .unwrap()
            .iter()
            .map(|ds| ds.index.to_string())
            .collect();
        assert_eq!(order, vec!["1_1", "2"]);
    }

    #[tokio::test]
    async fn backlog_is_migrated_once_then_left_alone() {
        let fx = Fixture::new();
        let tenant = TenantId::new();
        let ids = fx
            .manager
            .write_jobs(&[
                NewJob::new(tenant, "WEBHOOK", json!({})),
                NewJob::new(tenant, "WEBHOOK", json!({})),
            ])
            .await
            .unwrap();
        let source = fx.manager.current_dataset().await.unwrap();
        for state in [JobState::Executing, JobState::Succeeded] {
            fx.manager
                .store()
                .append_status(&source, &NewStatus::new(ids[0], state, 1))
                .await
                .unwrap();
        }
        fx.manager.rotate().await.unwrap();
        let pipeline = fx.pipeline(fx.local(), BackupSettings::enabled());

        let first = pipeline.run_once(&CancellationToken::new()).await.unwrap();
        assert!(matches!(first, ArchiveOutcome::Archived { migration: Some(_), .. }));

        for _ in 0..3 {
            let outcome = pipeline.run_once(&CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, ArchiveOutcome::Idle);
        }
        let order: Vec<String> = fx
            .manager
            .list_datasets()
            .await
            .unwrap()
            .iter()
            .map(|ds| ds.index.to_string())
            .collect();
        assert_eq!(order, vec!["1_1", "2"]);
    }

    #[tokio::test]
    async fn dataset_of_only_pending_jobs_is_not_archived() {
        let fx = Fixture::new();
        fx.manager
            .write_jobs(&[NewJob::new(TenantId::new(), "WEBHOOK", json!({}))])
            .await
            .unwrap();
        let source = fx.manager.current_dataset().await.unwrap();
        fx.manager.rotate().await.unwrap();

        for settings in [BackupSettings::enabled(), BackupSettings::enabled().with_failed_only(true)] {
            let pipeline = fx.pipeline(fx.local(), settings);
            assert!(pipeline.select_archivable().await.unwrap().is_none());
            let outcome = pipeline.run_once(&CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, ArchiveOutcome::Idle);
        }
        assert!(fx.manager.list_datasets().await.unwrap().contains(&source));
    }

    #[tokio::test]
    async fn failed_only_archival_keeps_waiting_jobs() {
        let fx = Fixture::new();
        let tenant = TenantId::new();
        let ids = fx
            .manager
            .write_jobs(&[
                NewJob::new(tenant, "WEBHOOK", json!({})),
                NewJob::new(tenant, "WEBHOOK", json!({})),
                NewJob::new(tenant, "WEBHOOK", json!({})),
            ])
            .await
            .unwrap();
        let source = fx.manager.current_dataset().await.unwrap();
        let store = fx.manager.store();
        for (id, last) in [(ids[0], JobState::Failed), (ids[1], JobState::Succeeded)] {
            for state in [JobState::Executing, last] {
                store
                    .append_status(&source, &NewStatus::new(id, state, 1))
                    .await
                    .unwrap();
            }
        }
        fx.manager.rotate().await.unwrap();

        let pipeline = fx.pipeline(fx.local(), BackupSettings::enabled().with_failed_only(true));
        let outcome = pipeline.run_once(&CancellationToken::new()).await.unwrap();
        let ArchiveOutcome::Archived { migration: Some(migration), artifacts, .. } = outcome else {
            panic!("expected a migration before archival");
        };
        assert_eq!(migration.moved, 1);
        assert_eq!(artifacts.len(), 1);
        assert!(!fx.manager.list_datasets().await.unwrap().contains(&source));

        let tracker = StatusTracker::new(fx.manager.clone(), 5);
        let recorded = tracker
            .record_status(NewStatus::new(ids[2], JobState::Executing, 1))
            .await
            .unwrap();
        assert_eq!(recorded.dataset, migration.to);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_failure_keeps_dataset_and_journal_entry() {
        let fx = Fixture::new();
        let metrics = ArchivalMetrics::unregistered();
        let dataset = fx.finished_dataset(2).await;
        let pipeline = fx
            .pipeline(Arc::new(FailingUploader), BackupSettings::enabled())
            .with_metrics(metrics.clone());

        let err = pipeline.run_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ArchiveError::UploadFailure { .. }));
        assert_eq!(metrics.backup_failures("rt", "S3"), 1);

        assert!(fx.manager.list_datasets().await.unwrap().contains(&dataset));
        let pending: Vec<_> = fx.manager.journal().recover_incomplete().await.unwrap().collect();
        assert_eq!(pending.len(), 1);

        // A retry reuses the pending entry instead of adding another.
        pipeline.run_once(&CancellationToken::new()).await.unwrap_err();
        let pending: Vec<_> = fx.manager.journal().recover_incomplete().await.unwrap().collect();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_archival_is_not_counted_as_failure() {
        let fx = Fixture::new();
        let metrics = ArchivalMetrics::unregistered();
        let dataset = fx.finished_dataset(2).await;
        let pipeline = fx
            .pipeline(fx.local(), BackupSettings::enabled())
            .with_metrics(metrics.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline.archive(&dataset, &cancel).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert_eq!(metrics.backup_failures("rt", "S3"), 0);
        assert!(fx.manager.list_datasets().await.unwrap().contains(&dataset));
    }
}
