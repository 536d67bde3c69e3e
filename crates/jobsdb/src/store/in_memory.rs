use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use strata_core::{JobId, JobState, TenantId};

use super::r#trait::{
    AppendOutcome, ExportBatch, ExportMode, JobStorage, PickupQuery, RawJournalEntry, RawRange,
    Retention, StoreError,
};
use crate::backup::export::window_by_payload;
use crate::dataset::Dataset;
use crate::job::{FailedJobRow, Job, JobStatus, NewJob, NewStatus, payload_size};

#[derive(Debug)]
struct DatasetData {
    dataset: Dataset,
    jobs: BTreeMap<JobId, Job>,
    /// Ascending status id.
    statuses: Vec<JobStatus>,
}

impl DatasetData {
    fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            jobs: BTreeMap::new(),
            statuses: Vec::new(),
        }
    }

    fn latest(&self, job_id: JobId) -> Option<&JobStatus> {
        self.statuses.iter().rev().find(|s| s.job_id == job_id)
    }

    fn latest_by_job(&self) -> HashMap<JobId, &JobStatus> {
        let mut latest = HashMap::new();
        for status in &self.statuses {
            latest.insert(status.job_id, status);
        }
        latest
    }

    fn is_pickable(latest: Option<&JobStatus>, now: DateTime<Utc>) -> bool {
        match latest {
            None => true,
            Some(s) if s.job_state == JobState::Failed => s.retry_time <= now,
            Some(s) => JobState::is_pickable(Some(s.job_state)),
        }
    }
}

#[derive(Debug, Default)]
struct Sequences {
    last_job_id: i64,
    last_status_id: i64,
}

#[derive(Debug, Default)]
struct Inner {
    /// Keyed by job table name.
    datasets: HashMap<String, DatasetData>,
    /// Keyed by queue prefix; ids are shared by all datasets of a queue.
    sequences: HashMap<String, Sequences>,
    journal: BTreeMap<i64, RawJournalEntry>,
    last_journal_id: i64,
}

impl Inner {
    fn dataset(&self, dataset: &Dataset) -> Result<&DatasetData, StoreError> {
        self.datasets
            .get(&dataset.job_table)
            .ok_or_else(|| StoreError::DatasetNotFound(dataset.job_table.clone()))
    }

    fn dataset_mut(&mut self, dataset: &Dataset) -> Result<&mut DatasetData, StoreError> {
        self.datasets
            .get_mut(&dataset.job_table)
            .ok_or_else(|| StoreError::DatasetNotFound(dataset.job_table.clone()))
    }
}

/// In-memory job storage.
///
/// Intended for tests/dev. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStorage {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, StoreError> {
        serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl JobStorage for InMemoryJobStorage {
    async fn list_datasets(&self, prefix: &str) -> Result<Vec<Dataset>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .datasets
            .values()
            .filter(|d| d.dataset.prefix == prefix)
            .map(|d| d.dataset.clone())
            .collect())
    }

    async fn create_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner
            .datasets
            .entry(dataset.job_table.clone())
            .or_insert_with(|| DatasetData::new(dataset.clone()));
        Ok(())
    }

    async fn drop_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.datasets.remove(&dataset.job_table);
        Ok(())
    }

    async fn job_range(&self, dataset: &Dataset) -> Result<Option<RawRange>, StoreError> {
        let inner = self.read()?;
        let data = inner.dataset(dataset)?;
        let (Some(first), Some(last)) = (data.jobs.values().next(), data.jobs.values().next_back())
        else {
            return Ok(None);
        };
        let min_created_at = data.jobs.values().map(|j| j.created_at).min().unwrap_or(first.created_at);
        let max_created_at = data.jobs.values().map(|j| j.created_at).max().unwrap_or(last.created_at);
        Ok(Some(RawRange {
            min_job_id: first.job_id,
            max_job_id: last.job_id,
            min_created_at,
            max_created_at,
        }))
    }

    async fn count_jobs(&self, dataset: &Dataset) -> Result<u64, StoreError> {
        let inner = self.read()?;
        Ok(inner.dataset(dataset)?.jobs.len() as u64)
    }

    async fn insert_jobs(&self, dataset: &Dataset, jobs: &[NewJob]) -> Result<Vec<JobId>, StoreError> {
        let mut inner = self.write()?;
        inner.dataset(dataset)?;

        let now = Utc::now();
        let mut ids = Vec::with_capacity(jobs.len());
        let mut created = Vec::with_capacity(jobs.len());
        {
            let seq = inner.sequences.entry(dataset.prefix.clone()).or_default();
            for job in jobs {
                seq.last_job_id += 1;
                let id = JobId::new(seq.last_job_id);
                ids.push(id);
                created.push(job.clone().into_job(id, now));
            }
        }

        let data = inner.dataset_mut(dataset)?;
        for job in created {
            data.jobs.insert(job.job_id, job);
        }
        Ok(ids)
    }

    async fn append_status(
        &self,
        dataset: &Dataset,
        status: &NewStatus,
    ) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.write()?;
        let data = inner.dataset(dataset)?;

        let Some(job) = data.jobs.get(&status.job_id) else {
            return Ok(AppendOutcome::UnknownJob);
        };
        let workspace_id = job.workspace_id;
        let current = data.latest(status.job_id).map(|s| s.job_state);
        if !JobState::can_transition(current, status.job_state) {
            return Ok(AppendOutcome::Rejected { current });
        }

        let seq = inner.sequences.entry(dataset.prefix.clone()).or_default();
        seq.last_status_id += 1;
        let status_id = seq.last_status_id;

        inner
            .dataset_mut(dataset)?
            .statuses
            .push(status.clone().into_status(status_id));
        Ok(AppendOutcome::Appended {
            status_id,
            workspace_id,
        })
    }

    async fn compact_statuses(&self, dataset: &Dataset, keep: usize) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let data = inner.dataset_mut(dataset)?;

        let mut seen: HashMap<JobId, usize> = HashMap::new();
        let mut retained = Vec::with_capacity(data.statuses.len());
        for status in data.statuses.drain(..).rev() {
            let count = seen.entry(status.job_id).or_default();
            *count += 1;
            if *count <= keep {
                retained.push(status);
            }
        }
        retained.reverse();

        let removed = seen.values().map(|n| n.saturating_sub(keep)).sum::<usize>();
        data.statuses = retained;
        Ok(removed as u64)
    }

    async fn pickable_jobs(&self, dataset: &Dataset, query: &PickupQuery) -> Result<Vec<Job>, StoreError> {
        let inner = self.read()?;
        let data = inner.dataset(dataset)?;
        let latest = data.latest_by_job();

        Ok(data
            .jobs
            .values()
            .filter(|j| j.workspace_id == query.tenant)
            .filter(|j| DatasetData::is_pickable(latest.get(&j.job_id).copied(), query.now))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn pending_counts(
        &self,
        dataset: &Dataset,
        now: DateTime<Utc>,
    ) -> Result<HashMap<TenantId, u64>, StoreError> {
        let inner = self.read()?;
        let data = inner.dataset(dataset)?;
        let latest = data.latest_by_job();

        let mut counts = HashMap::new();
        for job in data.jobs.values() {
            if DatasetData::is_pickable(latest.get(&job.job_id).copied(), now) {
                *counts.entry(job.workspace_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn count_unfinished(&self, dataset: &Dataset, retention: Retention) -> Result<u64, StoreError> {
        let inner = self.read()?;
        let data = inner.dataset(dataset)?;
        let latest = data.latest_by_job();
        Ok(data
            .jobs
            .keys()
            .filter(|id| retention.is_unfinished(latest.get(id).map(|s| s.job_state)))
            .count() as u64)
    }

    async fn migrate_unfinished(
        &self,
        from: &Dataset,
        to: &Dataset,
        retention: Retention,
    ) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let source = inner.dataset_mut(from)?;

        let latest = source.latest_by_job();
        let moving: HashSet<JobId> = source
            .jobs
            .keys()
            .copied()
            .filter(|id| retention.is_unfinished(latest.get(id).map(|s| s.job_state)))
            .collect();

        let jobs: Vec<Job> = moving
            .iter()
            .filter_map(|id| source.jobs.remove(id))
            .collect();
        let (statuses, kept): (Vec<JobStatus>, Vec<JobStatus>) = source
            .statuses
            .drain(..)
            .partition(|s| moving.contains(&s.job_id));
        source.statuses = kept;

        let target = inner
            .datasets
            .entry(to.job_table.clone())
            .or_insert_with(|| DatasetData::new(to.clone()));
        for job in jobs {
            target.jobs.insert(job.job_id, job);
        }
        target.statuses.extend(statuses);
        target.statuses.sort_by_key(|s| s.id);

        Ok(moving.len() as u64)
    }

    async fn delete_jobs_for_tenants(
        &self,
        dataset: &Dataset,
        tenants: &[TenantId],
    ) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let data = inner.dataset_mut(dataset)?;

        let doomed: HashSet<JobId> = data
            .jobs
            .values()
            .filter(|j| tenants.contains(&j.workspace_id))
            .map(|j| j.job_id)
            .collect();
        data.jobs.retain(|id, _| !doomed.contains(id));
        data.statuses.retain(|s| !doomed.contains(&s.job_id));
        Ok(doomed.len() as u64)
    }

    async fn count_export_rows(&self, dataset: &Dataset, mode: ExportMode) -> Result<u64, StoreError> {
        let inner = self.read()?;
        let data = inner.dataset(dataset)?;
        let count = match mode {
            ExportMode::Complete => data.jobs.len(),
            ExportMode::StatusOnly => data.statuses.len(),
            ExportMode::FailedOnly => data
                .latest_by_job()
                .values()
                .filter(|s| s.job_state.is_failure() && data.jobs.contains_key(&s.job_id))
                .count(),
        };
        Ok(count as u64)
    }

    async fn export_batch(
        &self,
        dataset: &Dataset,
        mode: ExportMode,
        batch: &ExportBatch,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let inner = self.read()?;
        let data = inner.dataset(dataset)?;
        let offset = usize::try_from(batch.offset).unwrap_or(usize::MAX);

        match mode {
            ExportMode::Complete => {
                let page: Vec<&Job> = data.jobs.values().skip(offset).take(batch.limit).collect();
                window_by_payload(page, batch.max_payload_bytes, |j| payload_size(&j.event_payload))
                    .into_iter()
                    .map(Self::to_json)
                    .collect()
            }
            ExportMode::StatusOnly => {
                let mut ordered: Vec<&JobStatus> = data.statuses.iter().collect();
                ordered.sort_by_key(|s| (s.job_id, s.id));
                let page: Vec<&JobStatus> = ordered.into_iter().skip(offset).take(batch.limit).collect();
                window_by_payload(page, batch.max_payload_bytes, |s| payload_size(&s.error_response))
                    .into_iter()
                    .map(Self::to_json)
                    .collect()
            }
            ExportMode::FailedOnly => {
                let mut rows: Vec<FailedJobRow> = data
                    .latest_by_job()
                    .into_values()
                    .filter(|s| s.job_state.is_failure())
                    .filter_map(|s| {
                        data.jobs
                            .get(&s.job_id)
                            .map(|job| FailedJobRow::new(job.clone(), s.clone()))
                    })
                    .collect();
                rows.sort_by(|a, b| {
                    (&a.job.custom_val, a.job.job_id, a.exec_time)
                        .cmp(&(&b.job.custom_val, b.job.job_id, b.exec_time))
                });
                let page: Vec<FailedJobRow> = rows.into_iter().skip(offset).take(batch.limit).collect();
                window_by_payload(page, batch.max_payload_bytes, |r| payload_size(&r.job.event_payload))
                    .iter()
                    .map(Self::to_json)
                    .collect()
            }
        }
    }

    async fn journal_insert(
        &self,
        owner: &str,
        operation: &str,
        payload: &JsonValue,
    ) -> Result<i64, StoreError> {
        let mut inner = self.write()?;
        inner.last_journal_id += 1;
        let id = inner.last_journal_id;
        inner.journal.insert(
            id,
            RawJournalEntry {
                id,
                owner: owner.to_string(),
                operation: operation.to_string(),
                payload: payload.clone(),
                start_time: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn journal_delete(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.journal.remove(&id);
        Ok(())
    }

    async fn journal_entries(&self, owner: &str) -> Result<Vec<RawJournalEntry>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .journal
            .values()
            .filter(|e| e.owner == owner)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dataset(index: &str) -> Dataset {
        Dataset::new("rt", index.parse().unwrap())
    }

    async fn seeded(tenant: TenantId, n: usize) -> (InMemoryJobStorage, Dataset, Vec<JobId>) {
        let store = InMemoryJobStorage::new();
        let ds = dataset("1");
        store.create_dataset(&ds).await.unwrap();
        let jobs: Vec<NewJob> = (0..n)
            .map(|i| NewJob::new(tenant, "WEBHOOK", json!({ "n": i })))
            .collect();
        let ids = store.insert_jobs(&ds, &jobs).await.unwrap();
        (store, ds, ids)
    }

    #[tokio::test]
    async fn job_ids_are_shared_across_datasets() {
        let tenant = TenantId::new();
        let (store, _, first) = seeded(tenant, 2).await;
        let ds2 = dataset("2");
        store.create_dataset(&ds2).await.unwrap();

        let second = store
            .insert_jobs(&ds2, &[NewJob::new(tenant, "WEBHOOK", json!({}))])
            .await
            .unwrap();

        assert_eq!(first, vec![JobId::new(1), JobId::new(2)]);
        assert_eq!(second, vec![JobId::new(3)]);
    }

    #[tokio::test]
    async fn append_checks_the_latest_state() {
        let tenant = TenantId::new();
        let (store, ds, ids) = seeded(tenant, 1).await;

        let outcome = store
            .append_status(&ds, &NewStatus::new(ids[0], JobState::Aborted, 1))
            .await
            .unwrap();
        assert!(matches!(outcome, AppendOutcome::Appended { workspace_id, .. } if workspace_id == tenant));

        let outcome = store
            .append_status(&ds, &NewStatus::new(ids[0], JobState::Executing, 2))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AppendOutcome::Rejected {
                current: Some(JobState::Aborted)
            }
        );

        let outcome = store
            .append_status(&ds, &NewStatus::new(JobId::new(99), JobState::Executing, 1))
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::UnknownJob);
    }

    #[tokio::test]
    async fn compaction_keeps_two_latest_rows_per_job() {
        let tenant = TenantId::new();
        let (store, ds, ids) = seeded(tenant, 2).await;
        for state in [JobState::Executing, JobState::Failed, JobState::Executing, JobState::Failed] {
            store
                .append_status(&ds, &NewStatus::new(ids[0], state, 1))
                .await
                .unwrap();
        }
        store
            .append_status(&ds, &NewStatus::new(ids[1], JobState::Executing, 1))
            .await
            .unwrap();

        let removed = store.compact_statuses(&ds, 2).await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.count_export_rows(&ds, ExportMode::StatusOnly).await.unwrap(), 3);
        let inner = store.read().unwrap();
        let data = inner.dataset(&ds).unwrap();
        assert_eq!(data.latest(ids[0]).unwrap().job_state, JobState::Failed);
    }

    #[tokio::test]
    async fn failed_jobs_wait_for_their_retry_time() {
        let tenant = TenantId::new();
        let (store, ds, ids) = seeded(tenant, 1).await;
        let later = Utc::now() + chrono::Duration::minutes(5);
        store
            .append_status(&ds, &NewStatus::new(ids[0], JobState::Executing, 1))
            .await
            .unwrap();
        store
            .append_status(
                &ds,
                &NewStatus::new(ids[0], JobState::Failed, 1).with_retry_at(later),
            )
            .await
            .unwrap();

        let now = Utc::now();
        let query = PickupQuery { tenant, limit: 10, now };
        assert!(store.pickable_jobs(&ds, &query).await.unwrap().is_empty());

        let query = PickupQuery {
            now: later + chrono::Duration::seconds(1),
            ..query
        };
        assert_eq!(store.pickable_jobs(&ds, &query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn migration_moves_only_unfinished_jobs() {
        let tenant = TenantId::new();
        let (store, ds, ids) = seeded(tenant, 3).await;
        store
            .append_status(&ds, &NewStatus::new(ids[0], JobState::Executing, 1))
            .await
            .unwrap();
        store
            .append_status(&ds, &NewStatus::new(ids[0], JobState::Succeeded, 1))
            .await
            .unwrap();
        store
            .append_status(&ds, &NewStatus::new(ids[1], JobState::Executing, 1))
            .await
            .unwrap();

        assert_eq!(store.count_unfinished(&ds, Retention::Terminal).await.unwrap(), 2);

        let target = dataset("1_1");
        let moved = store
            .migrate_unfinished(&ds, &target, Retention::Terminal)
            .await
            .unwrap();

        assert_eq!(moved, 2);
        assert_eq!(store.count_jobs(&ds).await.unwrap(), 1);
        assert_eq!(store.count_jobs(&target).await.unwrap(), 2);
        assert_eq!(store.count_export_rows(&target, ExportMode::StatusOnly).await.unwrap(), 1);
        assert_eq!(store.count_unfinished(&ds, Retention::Terminal).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_jobs_stay_behind_when_failures_are_archived() {
        let tenant = TenantId::new();
        let (store, ds, ids) = seeded(tenant, 2).await;
        for state in [JobState::Executing, JobState::Failed] {
            store
                .append_status(&ds, &NewStatus::new(ids[0], state, 1))
                .await
                .unwrap();
        }

        assert_eq!(store.count_unfinished(&ds, Retention::Terminal).await.unwrap(), 2);
        assert_eq!(store.count_unfinished(&ds, Retention::TerminalOrFailed).await.unwrap(), 1);

        let target = dataset("1_1");
        let moved = store
            .migrate_unfinished(&ds, &target, Retention::TerminalOrFailed)
            .await
            .unwrap();
        assert_eq!(moved, 1);
        let left = store.count_export_rows(&ds, ExportMode::FailedOnly).await.unwrap();
        assert_eq!(left, 1);
        assert_eq!(store.count_jobs(&target).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dataset_scoped_calls_fail_on_missing_dataset() {
        let store = InMemoryJobStorage::new();
        let err = store.count_jobs(&dataset("7")).await.unwrap_err();
        assert!(matches!(err, StoreError::DatasetNotFound(table) if table == "rt_jobs_7"));
        store.drop_dataset(&dataset("7")).await.unwrap();
    }
}
