use std::time::Duration;

use fleet_common::PolicyTemplate;

use crate::retry::RetryConfig;

/// Timeouts and limits for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound for a new or resized pool to reach Ready.
    pub provision_timeout: Duration,
    /// Upper bound for a workload's replicas to turn healthy.
    pub readiness_timeout: Duration,
    /// Upper bound for a draining pool to lose its last resident replica.
    pub drain_timeout: Duration,
    /// Delay between status polls while waiting on the provider.
    pub poll_interval: Duration,
    /// Replicas moved per batch during a migration.
    pub max_surge: u32,
    pub retry: RetryConfig,
    /// Policies attached to every node identity; topology tags are merged in.
    pub policy: PolicyTemplate,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(15 * 60),
            readiness_timeout: Duration::from_secs(5 * 60),
            drain_timeout: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(2),
            max_surge: 1,
            retry: RetryConfig::default(),
            policy: PolicyTemplate::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Millisecond polling and second-scale timeouts for simulated fleets.
    pub fn fast() -> Self {
        Self {
            provision_timeout: Duration::from_secs(5),
            readiness_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(2),
            max_surge: 1,
            retry: RetryConfig::fast(4),
            policy: PolicyTemplate::default(),
        }
    }
}
