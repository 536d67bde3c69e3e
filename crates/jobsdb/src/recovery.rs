//! Startup resolution of journal entries left by interrupted operations.

use tracing::{info, warn};

use crate::dataset::{DatasetError, DatasetManager};
use crate::journal::{JournalEntry, JournalError, JournalOp};

/// How unverifiable journal entries are treated at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Unverifiable entries abort startup.
    #[default]
    Normal,
    /// Unverifiable entries are logged and left for a later normal start.
    Degraded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries whose effects were verified or redone, then marked done.
    pub resolved: usize,
    /// Inconsistent entries left in place (degraded mode only).
    pub left: usize,
}

/// Resolve every incomplete journal entry of the manager's queue.
///
/// Replaying is idempotent: an entry is only deleted once its effects are
/// verified, so a crash during recovery leaves the same work for the next
/// start.
pub async fn recover(manager: &DatasetManager, mode: RecoveryMode) -> Result<RecoveryReport, DatasetError> {
    let journal = manager.journal();
    let mut report = RecoveryReport::default();

    for entry in journal.recover_incomplete().await? {
        let outcome = match entry {
            Ok(entry) => resolve(manager, &entry).await.map(|()| entry.id),
            Err(e) => Err(DatasetError::Journal(e)),
        };
        match outcome {
            Ok(id) => {
                journal.mark_done(id).await?;
                report.resolved += 1;
            }
            Err(DatasetError::Journal(e @ JournalError::JournalInconsistent { .. })) => match mode {
                RecoveryMode::Normal => return Err(DatasetError::Journal(e)),
                RecoveryMode::Degraded => {
                    warn!(owner = journal.owner(), error = %e, "leaving inconsistent journal entry");
                    report.left += 1;
                }
            },
            Err(e) => return Err(e),
        }
    }

    if report.resolved > 0 || report.left > 0 {
        info!(
            owner = journal.owner(),
            resolved = report.resolved,
            left = report.left,
            "journal recovery finished"
        );
    }
    Ok(report)
}

async fn resolve(manager: &DatasetManager, entry: &JournalEntry) -> Result<(), DatasetError> {
    match &entry.op {
        JournalOp::BackupDataset { dataset } => {
            let exists = manager
                .list_datasets()
                .await?
                .iter()
                .any(|ds| ds.index == dataset.index);
            if exists {
                // Nothing destructive happened; the archival loop redoes it.
                info!(id = entry.id, dataset = %dataset, "discarding interrupted backup");
                Ok(())
            } else {
                Err(JournalError::JournalInconsistent {
                    id: entry.id,
                    operation: entry.op.kind().to_string(),
                    reason: format!("dataset {dataset} was dropped without a confirmed backup"),
                }
                .into())
            }
        }
        JournalOp::DropDataset { dataset } => {
            // The backup was confirmed before this entry was written.
            info!(id = entry.id, dataset = %dataset, "completing interrupted drop");
            manager.drop_dataset(dataset).await
        }
        JournalOp::MigrateDatasets { from, to } => {
            // One store transaction: either nothing or everything moved.
            for dataset in from {
                manager.invalidate_range(dataset);
            }
            info!(id = entry.id, to = %to, "discarding interrupted migration");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotationConfig;
    use crate::dataset::Dataset;
    use crate::store::{InMemoryJobStorage, JobStorage};
    use serde_json::json;
    use std::sync::Arc;

    async fn setup() -> (Arc<InMemoryJobStorage>, DatasetManager, Dataset) {
        let store = Arc::new(InMemoryJobStorage::new());
        let manager = DatasetManager::new(store.clone(), "rt", RotationConfig::default());
        let first = manager.current_dataset().await.unwrap();
        manager.rotate().await.unwrap();
        (store, manager, first)
    }

    #[tokio::test]
    async fn interrupted_backup_of_live_dataset_is_discarded() {
        let (_, manager, first) = setup().await;
        manager
            .journal()
            .mark_start(&JournalOp::BackupDataset { dataset: first.clone() })
            .await
            .unwrap();

        let report = recover(&manager, RecoveryMode::Normal).await.unwrap();
        assert_eq!(report, RecoveryReport { resolved: 1, left: 0 });
        assert_eq!(manager.list_datasets().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn interrupted_drop_is_completed_and_replay_is_idempotent() {
        let (_, manager, first) = setup().await;
        let op = JournalOp::DropDataset { dataset: first.clone() };
        manager.journal().mark_start(&op).await.unwrap();
        manager.journal().mark_start(&op).await.unwrap();

        let report = recover(&manager, RecoveryMode::Normal).await.unwrap();
        assert_eq!(report.resolved, 2);
        let left: Vec<Dataset> = manager.list_datasets().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_ne!(left[0].index, first.index);

        let again = recover(&manager, RecoveryMode::Normal).await.unwrap();
        assert_eq!(again, RecoveryReport::default());
    }

    #[tokio::test]
    async fn backup_of_missing_dataset_is_fatal_in_normal_mode() {
        let (_, manager, first) = setup().await;
        manager
            .journal()
            .mark_start(&JournalOp::BackupDataset { dataset: first.clone() })
            .await
            .unwrap();
        manager.drop_dataset(&first).await.unwrap();

        let err = recover(&manager, RecoveryMode::Normal).await.unwrap_err();
        assert!(matches!(
            err,
            DatasetError::Journal(JournalError::JournalInconsistent { .. })
        ));
    }

    #[tokio::test]
    async fn degraded_mode_leaves_inconsistent_entries() {
        let (store, manager, first) = setup().await;
        manager
            .journal()
            .mark_start(&JournalOp::BackupDataset { dataset: first.clone() })
            .await
            .unwrap();
        manager.drop_dataset(&first).await.unwrap();
        store
            .journal_insert("rt", "unknown_op", &json!({"x": 1}))
            .await
            .unwrap();
        manager
            .journal()
            .mark_start(&JournalOp::MigrateDatasets {
                from: vec![first.clone()],
                to: Dataset::new("rt", "1_1".parse().unwrap()),
            })
            .await
            .unwrap();

        let report = recover(&manager, RecoveryMode::Degraded).await.unwrap();
        assert_eq!(report, RecoveryReport { resolved: 1, left: 2 });
        assert_eq!(store.journal_entries("rt").await.unwrap().len(), 2);
    }
}
