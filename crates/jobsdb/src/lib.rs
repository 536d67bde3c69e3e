//! `strata-jobsdb`: the partitioned job queue storage engine.
//!
//! Jobs land in the current dataset of a queue; older datasets are read-only
//! and are archived (exported, uploaded) and then dropped. Every destructive
//! maintenance step is guarded by the journal so an interrupted process can
//! be resumed safely.

pub mod backup;
pub mod config;
pub mod dataset;
pub mod handle;
pub mod job;
pub mod journal;
pub mod recovery;
pub mod status;
pub mod store;

pub use config::{BackupConfig, BackupSettings, ConfigError, JobsDbConfig, RotationConfig};
pub use dataset::{Dataset, DatasetError, DatasetIndex, DatasetManager, DatasetRange};
pub use handle::{Handle, HandleBuilder, HandleError, ReadOnly, ReadWrite, WorkerHandle, WriteOnly};
pub use job::{FailedJobRow, Job, JobStatus, NewJob, NewStatus};
pub use journal::{Journal, JournalEntry, JournalError, JournalOp};
pub use recovery::{RecoveryMode, RecoveryReport};
pub use status::{RecordedStatus, StatusError, StatusTracker};
pub use store::{InMemoryJobStorage, JobStorage, PostgresJobStorage, StoreError};
