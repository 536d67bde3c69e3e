//! Storage boundary of the job queue.
//!
//! `JobStorage` is the only way the engine touches persisted state. Two
//! backends are provided: an in-memory one for tests/dev and a Postgres one.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryJobStorage;
pub use postgres::PostgresJobStorage;
pub use query::ExportQuery;
pub use r#trait::{
    AppendOutcome, ExportBatch, ExportMode, JobStorage, PickupQuery, RawJournalEntry, RawRange,
    Retention, StoreError,
};
