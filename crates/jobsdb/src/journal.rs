//! Durable log of in-flight maintenance operations.
//!
//! An entry is written before an operation takes any destructive step and
//! deleted once the operation's effects are durable. Entries that survive a
//! crash are inspected by `recovery` at the next startup.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::dataset::Dataset;
use crate::store::{JobStorage, RawJournalEntry, StoreError};

/// A journaled operation with its typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JournalOp {
    BackupDataset { dataset: Dataset },
    DropDataset { dataset: Dataset },
    MigrateDatasets { from: Vec<Dataset>, to: Dataset },
}

impl JournalOp {
    pub fn kind(&self) -> &'static str {
        match self {
            JournalOp::BackupDataset { .. } => "backup_dataset",
            JournalOp::DropDataset { .. } => "drop_dataset",
            JournalOp::MigrateDatasets { .. } => "migrate_datasets",
        }
    }

    fn payload(&self) -> Result<JsonValue, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("payload")
            .map(JsonValue::take)
            .unwrap_or(JsonValue::Null))
    }

    pub fn decode(kind: &str, payload: &JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json!({ "kind": kind, "payload": payload }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub id: i64,
    pub op: JournalOp,
    pub owner: String,
    pub start_time: DateTime<Utc>,
}

impl JournalEntry {
    fn decode(raw: RawJournalEntry) -> Result<Self, JournalError> {
        let op = JournalOp::decode(&raw.operation, &raw.payload).map_err(|e| {
            JournalError::JournalInconsistent {
                id: raw.id,
                operation: raw.operation.clone(),
                reason: format!("undecodable payload: {e}"),
            }
        })?;
        Ok(Self {
            id: raw.id,
            op,
            owner: raw.owner,
            start_time: raw.start_time,
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JournalError {
    /// Needs operator attention; never discarded silently.
    #[error("journal entry {id} ({operation}) is inconsistent: {reason}")]
    JournalInconsistent {
        id: i64,
        operation: String,
        reason: String,
    },
    #[error("failed to encode journal payload: {0}")]
    Encode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Journal of one queue; entries are owned by the queue prefix.
#[derive(Debug, Clone)]
pub struct Journal {
    store: Arc<dyn JobStorage>,
    owner: String,
}

impl Journal {
    pub fn new(store: Arc<dyn JobStorage>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Persist an entry for `op`; it is committed when this returns.
    pub async fn mark_start(&self, op: &JournalOp) -> Result<i64, JournalError> {
        let payload = op
            .payload()
            .map_err(|e| JournalError::Encode(e.to_string()))?;
        let id = self
            .store
            .journal_insert(&self.owner, op.kind(), &payload)
            .await?;
        tracing::debug!(owner = %self.owner, id, kind = op.kind(), "journal entry started");
        Ok(id)
    }

    /// Reuse a pending entry for the same operation, or start a new one.
    ///
    /// Retried operations (e.g. an archival attempt after a failed upload)
    /// keep a single entry instead of accumulating one per attempt.
    pub async fn resume_or_start(&self, op: &JournalOp) -> Result<i64, JournalError> {
        let existing = self
            .store
            .journal_entries(&self.owner)
            .await?
            .into_iter()
            .find(|raw| {
                raw.operation == op.kind()
                    && JournalOp::decode(&raw.operation, &raw.payload).is_ok_and(|decoded| &decoded == op)
            });
        match existing {
            Some(raw) => {
                tracing::debug!(owner = %self.owner, id = raw.id, kind = op.kind(), "resuming journal entry");
                Ok(raw.id)
            }
            None => self.mark_start(op).await,
        }
    }

    /// Delete an entry once the operation's effects are durable.
    pub async fn mark_done(&self, id: i64) -> Result<(), JournalError> {
        self.store.journal_delete(id).await?;
        tracing::debug!(owner = %self.owner, id, "journal entry done");
        Ok(())
    }

    /// Entries left by operations that did not complete, oldest first.
    ///
    /// Entries are decoded lazily; an undecodable one yields
    /// `JournalInconsistent` without stopping the iteration.
    pub async fn recover_incomplete(
        &self,
    ) -> Result<impl Iterator<Item = Result<JournalEntry, JournalError>> + use<>, JournalError> {
        let raw = self.store.journal_entries(&self.owner).await?;
        Ok(raw.into_iter().map(JournalEntry::decode))
    }
}
