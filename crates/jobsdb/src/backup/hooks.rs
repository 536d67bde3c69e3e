//! Handlers run against a dataset right before it is exported.

use async_trait::async_trait;

use strata_core::TenantId;

use crate::dataset::Dataset;
use crate::store::{JobStorage, StoreError};

#[async_trait]
pub trait PreBackupHandler: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn handle(&self, store: &dyn JobStorage, dataset: &Dataset) -> Result<(), StoreError>;
}

/// Removes the jobs of excluded workspaces so they are never archived.
#[derive(Debug, Clone, Default)]
pub struct ExcludeWorkspaces {
    workspaces: Vec<TenantId>,
}

impl ExcludeWorkspaces {
    pub fn new(workspaces: impl IntoIterator<Item = TenantId>) -> Self {
        Self {
            workspaces: workspaces.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PreBackupHandler for ExcludeWorkspaces {
    fn name(&self) -> &str {
        "exclude_workspaces"
    }

    async fn handle(&self, store: &dyn JobStorage, dataset: &Dataset) -> Result<(), StoreError> {
        if self.workspaces.is_empty() {
            return Ok(());
        }
        let removed = store.delete_jobs_for_tenants(dataset, &self.workspaces).await?;
        tracing::info!(dataset = %dataset, removed, "removed jobs of excluded workspaces");
        Ok(())
    }
}
