//! Scheduler configuration.

use std::time::Duration;

use crate::policy::PickupPolicyKind;
use crate::stats::DEFAULT_ALPHA;

/// Settings for the multi-tenant scheduler.
///
/// Read from the environment with `from_env`:
///
/// - `MULTITENANT_POLICY`: `fair` (default) or `legacy`
/// - `MULTITENANT_MIN_PER_TENANT`: guaranteed jobs per tenant per cycle (default 10)
/// - `MULTITENANT_WINDOW_SECS`: scheduling window (default 10)
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub policy: PickupPolicyKind,
    pub min_per_tenant: usize,
    pub window: Duration,
    /// Smoothing factor for latency and failure averages.
    pub alpha: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: PickupPolicyKind::Fair,
            min_per_tenant: 10,
            window: Duration::from_secs(10),
            alpha: DEFAULT_ALPHA,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let policy = match std::env::var("MULTITENANT_POLICY") {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "invalid MULTITENANT_POLICY, using default");
                defaults.policy
            }),
            Err(_) => defaults.policy,
        };

        Self {
            policy,
            min_per_tenant: env_parse("MULTITENANT_MIN_PER_TENANT", defaults.min_per_tenant),
            window: Duration::from_secs(env_parse(
                "MULTITENANT_WINDOW_SECS",
                defaults.window.as_secs(),
            )),
            alpha: defaults.alpha,
        }
    }

    pub fn with_policy(mut self, policy: PickupPolicyKind) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_min_per_tenant(mut self, min: usize) -> Self {
        self.min_per_tenant = min;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable setting, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = SchedulerConfig::default()
            .with_policy(PickupPolicyKind::Legacy)
            .with_min_per_tenant(3)
            .with_window(Duration::from_secs(30));

        assert_eq!(config.policy, PickupPolicyKind::Legacy);
        assert_eq!(config.min_per_tenant, 3);
        assert_eq!(config.window, Duration::from_secs(30));
        assert_eq!(config.alpha, DEFAULT_ALPHA);
    }

    #[test]
    fn unset_variable_falls_back_to_default() {
        assert_eq!(env_parse("STRATA_TEST_UNSET_SCHEDULER_KEY", 7usize), 7);
    }
}
