//! Shared multi-tenant scheduler state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use strata_core::TenantId;

use crate::config::SchedulerConfig;
use crate::policy::{Allocation, PickupPolicy, PickupRequest};
use crate::stats::{TenantSnapshot, TenantStats};

type PoolStats = BTreeMap<TenantId, TenantStats>;

/// Tracks per-(pool, tenant) statistics and answers allocation requests.
///
/// Updates may arrive concurrently from many workers; each allocation works
/// on a consistent snapshot taken under a single read lock.
#[derive(Debug)]
pub struct MultiTenantScheduler {
    pools: RwLock<HashMap<String, PoolStats>>,
    policy: Arc<dyn PickupPolicy>,
    alpha: f64,
}

impl MultiTenantScheduler {
    pub fn new(policy: Arc<dyn PickupPolicy>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            policy,
            alpha: crate::stats::DEFAULT_ALPHA,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            alpha: config.alpha,
            ..Self::new(config.policy.build())
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Fold an observed per-job latency into the tenant's moving average.
    pub fn update_workspace_latency(&self, tenant: TenantId, pool: &str, latency: Duration) {
        self.with_stats(pool, tenant, |stats| stats.observe_latency(latency));
    }

    /// Record a processing outcome. A success also consumes one pending job.
    pub fn record_outcome(&self, tenant: TenantId, pool: &str, succeeded: bool, failed: bool) {
        self.with_stats(pool, tenant, |stats| stats.observe_outcome(succeeded, failed));
    }

    /// Add newly arrived pending work.
    pub fn report_pending(&self, pool: &str, counts: &HashMap<TenantId, u64>) {
        for (&tenant, &count) in counts {
            self.with_stats(pool, tenant, |stats| {
                stats.pending = stats.pending.saturating_add(count)
            });
        }
    }

    /// Pools that have seen any activity.
    pub fn pool_names(&self) -> Vec<String> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace pending counts with an authoritative view; tenants absent from
    /// `counts` have nothing pending.
    pub fn set_pending(&self, pool: &str, counts: &HashMap<TenantId, u64>) {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let entries = pools.entry(pool.to_string()).or_default();
        for stats in entries.values_mut() {
            stats.pending = 0;
        }
        for (&tenant, &count) in counts {
            entries
                .entry(tenant)
                .or_insert_with(|| TenantStats::with_alpha(self.alpha))
                .pending = count;
        }
    }

    /// Per-tenant pickup quota for one cycle of `pool`.
    pub fn pickup_allocation(
        &self,
        pool: &str,
        total_capacity: usize,
        window: Duration,
        min_per_tenant: usize,
    ) -> Allocation {
        let snapshot = self.snapshot(pool);
        let allocation = self.policy.allocate(&PickupRequest {
            tenants: &snapshot,
            capacity: total_capacity,
            window,
            min_per_tenant,
        });
        tracing::debug!(
            pool,
            policy = self.policy.name(),
            tenants = snapshot.len(),
            capacity = total_capacity,
            allocated = allocation.values().sum::<usize>(),
            "computed pickup allocation"
        );
        allocation
    }

    /// Stats of every known tenant in `pool`, ordered by tenant id.
    pub fn snapshot(&self, pool: &str) -> Vec<TenantSnapshot> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        pools
            .get(pool)
            .map(|tenants| {
                tenants
                    .iter()
                    .map(|(tenant, stats)| stats.snapshot(*tenant))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn with_stats(&self, pool: &str, tenant: TenantId, update: impl FnOnce(&mut TenantStats)) {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let stats = pools
            .entry(pool.to_string())
            .or_default()
            .entry(tenant)
            .or_insert_with(|| TenantStats::with_alpha(self.alpha));
        update(stats);
    }
}

impl Default for MultiTenantScheduler {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PickupPolicyKind;
    use std::thread;

    const POOL: &str = "router";

    #[test]
    fn pending_is_tracked_per_pool() {
        let scheduler = MultiTenantScheduler::default();
        let tenant = TenantId::new();

        scheduler.report_pending(POOL, &HashMap::from([(tenant, 5)]));
        scheduler.report_pending(POOL, &HashMap::from([(tenant, 3)]));
        scheduler.report_pending("batch", &HashMap::from([(tenant, 1)]));

        assert_eq!(scheduler.snapshot(POOL)[0].pending, 8);
        assert_eq!(scheduler.snapshot("batch")[0].pending, 1);
        assert_eq!(scheduler.pool_names(), vec!["batch", POOL]);

        scheduler.record_outcome(tenant, POOL, true, false);
        assert_eq!(scheduler.snapshot(POOL)[0].pending, 7);
    }

    #[test]
    fn set_pending_clears_tenants_not_listed() {
        let scheduler = MultiTenantScheduler::default();
        let a = TenantId::new();
        let b = TenantId::new();

        scheduler.report_pending(POOL, &HashMap::from([(a, 4), (b, 4)]));
        scheduler.set_pending(POOL, &HashMap::from([(b, 2)]));

        let allocation = scheduler.pickup_allocation(POOL, 100, Duration::from_secs(10), 1);
        assert!(!allocation.contains_key(&a));
        assert_eq!(allocation[&b], 2);
    }

    #[test]
    fn slow_tenant_gets_smaller_share() {
        let scheduler = MultiTenantScheduler::new(PickupPolicyKind::Fair.build());
        let fast = TenantId::new();
        let slow = TenantId::new();
        scheduler.set_pending(POOL, &HashMap::from([(fast, 1_000), (slow, 1_000)]));
        scheduler.update_workspace_latency(fast, POOL, Duration::from_millis(5));
        scheduler.update_workspace_latency(slow, POOL, Duration::from_millis(100));

        let allocation = scheduler.pickup_allocation(POOL, 300, Duration::from_secs(60), 10);

        assert!(allocation[&slow] >= 10);
        assert!(allocation[&fast] > allocation[&slow]);
        assert!(allocation.values().sum::<usize>() <= 300);
    }

    #[test]
    fn concurrent_updates_are_all_applied() {
        let scheduler = Arc::new(MultiTenantScheduler::default());
        let tenant = TenantId::new();
        scheduler.set_pending(POOL, &HashMap::from([(tenant, 0)]));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || {
                    for _ in 0..100 {
                        scheduler.report_pending(POOL, &HashMap::from([(tenant, 1)]));
                        scheduler.update_workspace_latency(tenant, POOL, Duration::from_millis(10));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let snapshot = scheduler.snapshot(POOL);
        assert_eq!(snapshot[0].pending, 800);
        let latency = snapshot[0].latency_secs.unwrap();
        assert!((latency - 0.01).abs() < 1e-9);
    }
}
