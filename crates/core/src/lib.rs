//! `strata-core`: shared building blocks for the job queue engine.
//!
//! This crate holds the **pure** pieces (no storage, no runtime): identifiers,
//! the job lifecycle state machine and the domain error type.

pub mod error;
pub mod id;
pub mod state;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TenantId};
pub use state::JobState;
