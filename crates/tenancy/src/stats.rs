//! Per-tenant moving statistics.

use std::time::Duration;

use strata_core::TenantId;

/// Smoothing factor used when none is configured.
pub const DEFAULT_ALPHA: f64 = 0.2;

/// Exponentially weighted moving average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            value: None,
        }
    }

    /// Fold a new sample in. The first sample seeds the average.
    pub fn observe(&mut self, sample: f64) {
        self.value = Some(match self.value {
            None => sample,
            Some(current) => current + self.alpha * (sample - current),
        });
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl Default for Ewma {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

/// Working statistics for one tenant in one pool.
#[derive(Debug, Clone, Default)]
pub struct TenantStats {
    /// Seconds per job.
    pub latency: Ewma,
    /// 1.0 for a failed outcome, 0.0 for a success.
    pub failure_rate: Ewma,
    pub successes: u64,
    pub failures: u64,
    /// Jobs currently eligible for pickup.
    pub pending: u64,
}

impl TenantStats {
    pub fn with_alpha(alpha: f64) -> Self {
        Self {
            latency: Ewma::new(alpha),
            failure_rate: Ewma::new(alpha),
            ..Default::default()
        }
    }

    pub fn observe_latency(&mut self, latency: Duration) {
        self.latency.observe(latency.as_secs_f64());
    }

    pub fn observe_outcome(&mut self, succeeded: bool, failed: bool) {
        if succeeded {
            self.successes += 1;
            self.failure_rate.observe(0.0);
            self.pending = self.pending.saturating_sub(1);
        }
        if failed {
            self.failures += 1;
            self.failure_rate.observe(1.0);
        }
    }

    pub fn snapshot(&self, tenant: TenantId) -> TenantSnapshot {
        TenantSnapshot {
            tenant,
            pending: self.pending,
            latency_secs: self.latency.value(),
            failure_rate: self.failure_rate.value().unwrap_or(0.0),
        }
    }
}

/// Immutable copy of a tenant's stats, taken once per scheduling cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantSnapshot {
    pub tenant: TenantId,
    pub pending: u64,
    pub latency_secs: Option<f64>,
    pub failure_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_average() {
        let mut avg = Ewma::new(0.5);
        assert_eq!(avg.value(), None);

        avg.observe(4.0);
        assert_eq!(avg.value(), Some(4.0));

        avg.observe(2.0);
        assert_eq!(avg.value(), Some(3.0));
    }

    #[test]
    fn successes_drain_pending_and_failures_raise_the_rate() {
        let mut stats = TenantStats::with_alpha(0.5);
        stats.pending = 2;

        stats.observe_outcome(false, true);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failure_rate.value(), Some(1.0));

        stats.observe_outcome(true, false);
        stats.observe_outcome(true, false);
        stats.observe_outcome(true, false);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.successes, 3);
        assert!(stats.failure_rate.value().unwrap() < 0.2);
    }
}
