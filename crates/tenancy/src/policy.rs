//! Allocation strategies.
//!
//! A policy turns a set of tenant snapshots and a pool capacity into a
//! per-tenant pickup quota. Policies are pure: all shared state lives in the
//! scheduler, which hands each call an immutable snapshot.

use std::collections::HashMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use strata_core::{DomainError, TenantId};

use crate::stats::TenantSnapshot;

/// Tenant -> number of jobs it may be handed this cycle.
pub type Allocation = HashMap<TenantId, usize>;

/// Input to a single allocation.
#[derive(Debug, Clone, Copy)]
pub struct PickupRequest<'a> {
    pub tenants: &'a [TenantSnapshot],
    pub capacity: usize,
    /// Scheduling window; a tenant is not handed more than it can finish in it.
    pub window: Duration,
    pub min_per_tenant: usize,
}

pub trait PickupPolicy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Never allocates more than `capacity` in total nor more than a tenant's
    /// pending count.
    fn allocate(&self, request: &PickupRequest<'_>) -> Allocation;
}

/// Which policy a scheduler should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PickupPolicyKind {
    Legacy,
    #[default]
    Fair,
}

impl PickupPolicyKind {
    pub fn build(self) -> Arc<dyn PickupPolicy> {
        match self {
            PickupPolicyKind::Legacy => Arc::new(LegacyPickup::default()),
            PickupPolicyKind::Fair => Arc::new(FairPickup::default()),
        }
    }
}

impl FromStr for PickupPolicyKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(PickupPolicyKind::Legacy),
            "fair" => Ok(PickupPolicyKind::Fair),
            other => Err(DomainError::validation(format!(
                "unknown pickup policy '{other}' (expected 'legacy' or 'fair')"
            ))),
        }
    }
}

/// Round-robin over tenants with pending work, ignoring latency and failures.
///
/// The starting tenant rotates between calls so the leftover slots of an
/// uneven split do not always land on the same tenants.
#[derive(Debug, Default)]
pub struct LegacyPickup {
    cursor: AtomicUsize,
}

impl PickupPolicy for LegacyPickup {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn allocate(&self, request: &PickupRequest<'_>) -> Allocation {
        let tenants: Vec<&TenantSnapshot> =
            request.tenants.iter().filter(|t| t.pending > 0).collect();
        let mut allocation = Allocation::new();
        if tenants.is_empty() || request.capacity == 0 {
            return allocation;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % tenants.len();
        let order: Vec<&TenantSnapshot> = tenants[start..]
            .iter()
            .chain(tenants[..start].iter())
            .copied()
            .collect();

        let mut given = vec![0usize; order.len()];
        let mut remaining = request.capacity;
        let mut active: Vec<usize> = (0..order.len()).collect();

        while remaining > 0 && !active.is_empty() {
            let share = (remaining / active.len()).max(1);
            for &i in &active {
                if remaining == 0 {
                    break;
                }
                let headroom = pending_of(order[i]) - given[i];
                let grant = share.min(headroom).min(remaining);
                given[i] += grant;
                remaining -= grant;
            }
            active.retain(|&i| given[i] < pending_of(order[i]));
        }

        for (i, tenant) in order.iter().enumerate() {
            if given[i] > 0 {
                allocation.insert(tenant.tenant, given[i]);
            }
        }
        allocation
    }
}

/// Latency- and failure-aware allocation.
///
/// 1. Every tenant with pending work first receives `min_per_tenant` (or its
///    pending count if smaller). When capacity cannot cover that floor for
///    everyone, the floor is scaled down to `capacity / tenants`.
/// 2. The remainder is split in proportion to a weight of
///    `max(1 - failure_rate, min_weight) / latency`, so fast, healthy tenants
///    get more and slow or failing tenants are throttled without starving.
/// 3. No tenant is handed more than its pending count, nor more than it can
///    process within the window at its observed latency.
#[derive(Debug, Clone)]
pub struct FairPickup {
    /// Lower bound on the health factor so failing tenants keep a share.
    pub min_weight: f64,
}

impl Default for FairPickup {
    fn default() -> Self {
        Self { min_weight: 0.05 }
    }
}

impl FairPickup {
    fn weight(&self, tenant: &TenantSnapshot, fallback_latency: f64) -> f64 {
        let health = (1.0 - tenant.failure_rate).max(self.min_weight);
        let latency = tenant
            .latency_secs
            .filter(|l| *l > 0.0)
            .unwrap_or(fallback_latency);
        health / latency
    }

    fn ceiling(tenant: &TenantSnapshot, floor: usize, window: Duration) -> usize {
        let pending = pending_of(tenant);
        let by_window = match tenant.latency_secs {
            Some(latency) if latency > 0.0 => {
                let jobs = window.as_secs_f64() / latency;
                if jobs >= usize::MAX as f64 {
                    usize::MAX
                } else {
                    jobs.floor() as usize
                }
            }
            _ => usize::MAX,
        };
        pending.min(by_window.max(floor))
    }
}

impl PickupPolicy for FairPickup {
    fn name(&self) -> &'static str {
        "fair"
    }

    fn allocate(&self, request: &PickupRequest<'_>) -> Allocation {
        let tenants: Vec<&TenantSnapshot> =
            request.tenants.iter().filter(|t| t.pending > 0).collect();
        let mut allocation = Allocation::new();
        if tenants.is_empty() || request.capacity == 0 {
            return allocation;
        }

        let floor = request
            .min_per_tenant
            .min(request.capacity / tenants.len());

        let known: Vec<f64> = tenants
            .iter()
            .filter_map(|t| t.latency_secs)
            .filter(|l| *l > 0.0)
            .collect();
        let fallback_latency = if known.is_empty() {
            1.0
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };

        let weights: Vec<f64> = tenants
            .iter()
            .map(|t| self.weight(t, fallback_latency))
            .collect();
        let ceilings: Vec<usize> = tenants
            .iter()
            .map(|t| Self::ceiling(t, floor, request.window))
            .collect();

        let mut given: Vec<usize> = tenants
            .iter()
            .map(|t| floor.min(pending_of(t)))
            .collect();
        let mut remaining = request.capacity - given.iter().sum::<usize>();
        let mut active: Vec<usize> = (0..tenants.len())
            .filter(|&i| given[i] < ceilings[i])
            .collect();

        // Water-filling: hand out the remainder proportionally, re-spreading
        // whatever capped tenants cannot absorb.
        while remaining > 0 && !active.is_empty() {
            let total_weight: f64 = active.iter().map(|&i| weights[i]).sum();
            let mut granted = 0usize;
            for &i in &active {
                let share = (remaining as f64 * weights[i] / total_weight).floor() as usize;
                let grant = share.min(ceilings[i] - given[i]).min(remaining - granted);
                given[i] += grant;
                granted += grant;
            }

            if granted == 0 {
                // Shares rounded down to zero; give a single slot to the
                // heaviest tenant so the loop always makes progress.
                let heaviest = active
                    .iter()
                    .copied()
                    .max_by(|&a, &b| {
                        weights[a]
                            .total_cmp(&weights[b])
                            .then_with(|| tenants[b].tenant.cmp(&tenants[a].tenant))
                    })
                    .unwrap_or(active[0]);
                given[heaviest] += 1;
                granted = 1;
            }

            remaining -= granted;
            active.retain(|&i| given[i] < ceilings[i]);
        }

        for (i, tenant) in tenants.iter().enumerate() {
            if given[i] > 0 {
                allocation.insert(tenant.tenant, given[i]);
            }
        }
        allocation
    }
}

fn pending_of(tenant: &TenantSnapshot) -> usize {
    usize::try_from(tenant.pending).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(pending: u64, latency: Option<f64>, failure_rate: f64) -> TenantSnapshot {
        TenantSnapshot {
            tenant: TenantId::new(),
            pending,
            latency_secs: latency,
            failure_rate,
        }
    }

    fn request(tenants: &[TenantSnapshot], capacity: usize, min: usize) -> PickupRequest<'_> {
        PickupRequest {
            tenants,
            capacity,
            window: Duration::from_secs(10),
            min_per_tenant: min,
        }
    }

    #[test]
    fn fair_gives_every_tenant_its_minimum_then_favours_fast_ones() {
        let fast = snapshot(1_000, Some(0.01), 0.0);
        let slow = snapshot(1_000, Some(0.5), 0.0);
        let tenants = vec![fast.clone(), slow.clone()];

        let allocation = FairPickup::default().allocate(&request(&tenants, 100, 10));

        assert!(allocation[&slow.tenant] >= 10);
        assert!(allocation[&fast.tenant] > allocation[&slow.tenant]);
        assert!(allocation.values().sum::<usize>() <= 100);
    }

    #[test]
    fn fair_caps_slow_tenant_by_window() {
        // 2s per job over a 10s window: at most 5 jobs, even with spare capacity.
        let slow = snapshot(1_000, Some(2.0), 0.0);
        let tenants = vec![slow.clone()];

        let allocation = FairPickup::default().allocate(&request(&tenants, 100, 1));

        assert_eq!(allocation[&slow.tenant], 5);
    }

    #[test]
    fn failing_tenant_is_throttled_but_not_starved() {
        let healthy = snapshot(1_000, Some(0.001), 0.0);
        let failing = snapshot(1_000, Some(0.001), 1.0);
        let tenants = vec![healthy.clone(), failing.clone()];

        let allocation = FairPickup::default().allocate(&request(&tenants, 200, 10));

        assert!(allocation[&failing.tenant] >= 10);
        assert!(allocation[&healthy.tenant] > allocation[&failing.tenant] * 5);
    }

    #[test]
    fn minimum_scales_down_when_capacity_is_short() {
        let tenants: Vec<_> = (0..4).map(|_| snapshot(100, None, 0.0)).collect();

        let allocation = FairPickup::default().allocate(&request(&tenants, 8, 10));

        assert_eq!(allocation.values().sum::<usize>(), 8);
        for tenant in &tenants {
            assert_eq!(allocation[&tenant.tenant], 2);
        }
    }

    #[test]
    fn tenants_without_pending_work_get_nothing() {
        let idle = snapshot(0, Some(0.1), 0.0);
        let busy = snapshot(3, Some(0.1), 0.0);
        let tenants = vec![idle.clone(), busy.clone()];

        let allocation = FairPickup::default().allocate(&request(&tenants, 50, 10));

        assert!(!allocation.contains_key(&idle.tenant));
        assert_eq!(allocation[&busy.tenant], 3);
    }

    #[test]
    fn legacy_round_robins_within_pending() {
        let small = snapshot(2, None, 0.0);
        let large = snapshot(100, None, 0.0);
        let tenants = vec![small.clone(), large.clone()];

        let allocation = LegacyPickup::default().allocate(&request(&tenants, 20, 0));

        assert_eq!(allocation[&small.tenant], 2);
        assert_eq!(allocation[&large.tenant], 18);
    }

    #[test]
    fn legacy_rotates_the_leftover_slot() {
        let a = snapshot(10, None, 0.0);
        let b = snapshot(10, None, 0.0);
        let tenants = vec![a.clone(), b.clone()];
        let policy = LegacyPickup::default();

        let first = policy.allocate(&request(&tenants, 1, 0));
        let second = policy.allocate(&request(&tenants, 1, 0));

        assert_eq!(first.get(&a.tenant), Some(&1));
        assert_eq!(second.get(&b.tenant), Some(&1));
    }

    #[test]
    fn policy_kind_parses() {
        assert_eq!("Fair".parse::<PickupPolicyKind>().unwrap(), PickupPolicyKind::Fair);
        assert_eq!(" legacy ".parse::<PickupPolicyKind>().unwrap(), PickupPolicyKind::Legacy);
        assert!("greedy".parse::<PickupPolicyKind>().is_err());
        assert_eq!(PickupPolicyKind::Legacy.build().name(), "legacy");
    }

    fn tenants_strategy() -> impl Strategy<Value = Vec<TenantSnapshot>> {
        prop::collection::vec(
            (
                0u64..500,
                prop::option::of(0.001f64..5.0),
                0.0f64..=1.0,
            )
                .prop_map(|(pending, latency, failure)| snapshot(pending, latency, failure)),
            1..12,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn fair_respects_capacity_pending_and_minimum(
            tenants in tenants_strategy(),
            capacity in 0usize..2_000,
            min in 0usize..20,
        ) {
            let allocation = FairPickup::default().allocate(&request(&tenants, capacity, min));

            prop_assert!(allocation.values().sum::<usize>() <= capacity);
            for tenant in &tenants {
                let given = allocation.get(&tenant.tenant).copied().unwrap_or(0);
                prop_assert!(given as u64 <= tenant.pending);
            }

            let eligible = tenants.iter().filter(|t| t.pending > 0).count();
            if eligible > 0 && capacity >= eligible * min {
                for tenant in tenants.iter().filter(|t| t.pending > 0) {
                    let given = allocation.get(&tenant.tenant).copied().unwrap_or(0);
                    prop_assert!(given as u64 >= (min as u64).min(tenant.pending));
                }
            }
        }

        #[test]
        fn legacy_respects_capacity_and_pending(
            tenants in tenants_strategy(),
            capacity in 0usize..2_000,
        ) {
            let allocation = LegacyPickup::default().allocate(&request(&tenants, capacity, 0));

            let total_pending: u64 = tenants.iter().map(|t| t.pending).sum();
            let total = allocation.values().sum::<usize>();
            prop_assert!(total <= capacity);
            prop_assert_eq!(total as u64, total_pending.min(capacity as u64));
            for tenant in &tenants {
                let given = allocation.get(&tenant.tenant).copied().unwrap_or(0);
                prop_assert!(given as u64 <= tenant.pending);
            }
        }
    }
}
