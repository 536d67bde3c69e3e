//! Multi-tenant fair pickup.
//!
//! Decides, per scheduling cycle and per consumer pool, how many pending jobs
//! each tenant (workspace) may be handed, so one tenant's backlog, speed or
//! failures cannot monopolize a shared pool.
//!
//! ## Components
//!
//! - `TenantStats`: moving latency / failure measures and pending counts
//! - `PickupPolicy`: allocation strategy (`LegacyPickup`, `FairPickup`)
//! - `MultiTenantScheduler`: shared, concurrently updated stats + the selected policy

pub mod config;
pub mod policy;
pub mod scheduler;
pub mod stats;

pub use config::SchedulerConfig;
pub use policy::{Allocation, FairPickup, LegacyPickup, PickupPolicy, PickupPolicyKind, PickupRequest};
pub use scheduler::MultiTenantScheduler;
pub use stats::{Ewma, TenantSnapshot, TenantStats};
