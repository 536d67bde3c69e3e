use std::sync::Arc;

use anyhow::Context;
use prometheus::Registry;

use strata_jobsdb::backup::LocalDirUploader;
use strata_jobsdb::{BackupSettings, Handle, JobsDbConfig, PostgresJobStorage, ReadWrite, RecoveryMode};
use strata_observability::ArchivalMetrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    strata_observability::init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let prefix = std::env::var("JOBSDB_PREFIX").unwrap_or_else(|_| "rt".to_string());
    let archive_dir = std::env::var("JOBSDB_ARCHIVE_DIR").unwrap_or_else(|_| {
        tracing::warn!("JOBSDB_ARCHIVE_DIR not set; archiving under ./archive");
        "./archive".to_string()
    });
    let degraded = std::env::var("JOBSDB_DEGRADED_START").is_ok_and(|v| v == "true");
    let failed_only = std::env::var("JOBSDB_BACKUP_FAILED_ONLY").is_ok_and(|v| v == "true");

    let store = PostgresJobStorage::connect(&database_url)
        .await
        .context("failed to connect to postgres")?;
    store.ensure_schema().await.context("failed to create journal schema")?;

    let config = JobsDbConfig::from_env(prefix)
        .with_settings(BackupSettings::enabled().with_failed_only(failed_only));
    let registry = Registry::new();
    let uploader = LocalDirUploader::new(archive_dir).with_provider(config.backup.storage_provider.clone());

    let mode = if degraded { RecoveryMode::Degraded } else { RecoveryMode::Normal };
    let handle = Handle::<ReadWrite>::builder(Arc::new(store), config)
        .uploader(Arc::new(uploader))
        .metrics(ArchivalMetrics::register(&registry))
        .open(mode)
        .await
        .context("failed to open queue")?;

    let workers = handle.start();
    tracing::info!(prefix = %handle.config().prefix, "jobsdb maintenance running");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    workers.shutdown().await;
    Ok(())
}
