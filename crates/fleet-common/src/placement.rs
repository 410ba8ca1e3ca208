use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::util::saturating_total;
use crate::workload::WorkloadKey;

/// Scheduler's view of one workload: per-pool targets and healthy replicas.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaHealth {
    #[serde(default)]
    pub targets: BTreeMap<String, u32>,
    #[serde(default)]
    pub healthy: BTreeMap<String, u32>,
    /// The workload's service has endpoints behind it.
    #[serde(default)]
    pub endpoints_ready: bool,
}

impl ReplicaHealth {
    pub fn total_targets(&self) -> u32 {
        saturating_total(self.targets.values())
    }

    pub fn total_healthy(&self) -> u32 {
        saturating_total(self.healthy.values())
    }
}

/// Observed placement of a workload, owned by the placement coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacementState {
    pub workload: WorkloadKey,
    pub desired_replicas: u32,
    /// Replica targets per pool; pools with a zero target are omitted.
    pub pools: BTreeMap<String, u32>,
    pub healthy: BTreeMap<String, u32>,
    pub ready: bool,
    /// Last observation, ms since epoch.
    #[serde(default)]
    pub observed_at_ms: u64,
}

impl PlacementState {
    pub fn from_health(
        workload: WorkloadKey,
        desired_replicas: u32,
        health: &ReplicaHealth,
        observed_at_ms: u64,
    ) -> Self {
        let pools: BTreeMap<String, u32> = health
            .targets
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(p, n)| (p.clone(), *n))
            .collect();
        let all_healthy = pools
            .iter()
            .all(|(p, n)| health.healthy.get(p).copied().unwrap_or(0) >= *n);
        let total = saturating_total(pools.values());
        let ready = total == desired_replicas
            && all_healthy
            && (desired_replicas == 0 || health.endpoints_ready);
        Self {
            workload,
            desired_replicas,
            pools,
            healthy: health.healthy.clone(),
            ready,
            observed_at_ms,
        }
    }

    pub fn is_placed(&self) -> bool {
        !self.pools.is_empty()
    }

    pub fn total_targets(&self) -> u32 {
        saturating_total(self.pools.values())
    }

    pub fn total_healthy(&self) -> u32 {
        saturating_total(self.healthy.values())
    }

    pub fn replicas_on(&self, pool: &str) -> u32 {
        self.pools.get(pool).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> WorkloadKey {
        WorkloadKey {
            namespace: "apps".into(),
            name: "echoserver".into(),
        }
    }

    #[test]
    fn ready_requires_targets_healthy_and_endpoints() {
        let mut health = ReplicaHealth {
            targets: BTreeMap::from([("ng-standard".to_string(), 3)]),
            healthy: BTreeMap::from([("ng-standard".to_string(), 3)]),
            endpoints_ready: false,
        };
        assert!(!PlacementState::from_health(key(), 3, &health, 0).ready);

        health.endpoints_ready = true;
        assert!(PlacementState::from_health(key(), 3, &health, 0).ready);

        health.healthy.insert("ng-standard".into(), 2);
        assert!(!PlacementState::from_health(key(), 3, &health, 0).ready);
    }

    #[test]
    fn zero_targets_are_dropped() {
        let health = ReplicaHealth {
            targets: BTreeMap::from([("ng-old".to_string(), 0), ("ng-new".to_string(), 2)]),
            healthy: BTreeMap::from([("ng-new".to_string(), 2)]),
            endpoints_ready: true,
        };
        let state = PlacementState::from_health(key(), 2, &health, 0);
        assert_eq!(state.pools.len(), 1);
        assert_eq!(state.replicas_on("ng-old"), 0);
        assert!(state.ready);
    }

    #[test]
    fn huge_counts_do_not_wrap() {
        let health = ReplicaHealth {
            targets: BTreeMap::from([("ng-1".to_string(), u32::MAX), ("ng-2".to_string(), 2)]),
            healthy: BTreeMap::from([("ng-1".to_string(), u32::MAX), ("ng-2".to_string(), 2)]),
            endpoints_ready: true,
        };
        assert_eq!(health.total_targets(), u32::MAX);
        assert_eq!(health.total_healthy(), u32::MAX);

        // A wrapped sum would read 1 and look ready for a single replica.
        let state = PlacementState::from_health(key(), 1, &health, 0);
        assert!(!state.ready);
        assert_eq!(state.total_targets(), u32::MAX);
        assert_eq!(state.total_healthy(), u32::MAX);
    }
}
