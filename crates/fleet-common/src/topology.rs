use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::pool::NodePoolSpec;
use crate::taint::validate_taints;
use crate::workload::WorkloadSpec;

/// Declared fleet layout the orchestrator converges toward.
///
/// Stored in the meta store under `/fleet/topology/target`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    #[serde(default)]
    pub pools: Vec<NodePoolSpec>,

    #[serde(default)]
    pub workloads: Vec<WorkloadSpec>,

    /// Tags applied to every identity and pool (e.g. project, org).
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Topology {
    pub fn pool(&self, name: &str) -> Option<&NodePoolSpec> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Full validation, including every pool's taint set.
    pub fn validate(&self) -> Result<(), FleetError> {
        self.validate_structure()?;
        for pool in &self.pools {
            validate_taints(&pool.taints)?;
        }
        Ok(())
    }

    /// Names and capacities only. Taint sets are checked per pool when the
    /// pool is provisioned, so one bad pool does not block the others.
    pub fn validate_structure(&self) -> Result<(), FleetError> {
        let mut names = HashSet::new();
        for pool in &self.pools {
            if pool.name.is_empty() {
                return Err(FleetError::invalid_topology("pool with empty name"));
            }
            if !names.insert(pool.name.as_str()) {
                return Err(FleetError::invalid_topology(format!(
                    "pool {} declared twice",
                    pool.name
                )));
            }
            if pool.pods_per_node == 0 {
                return Err(FleetError::invalid_topology(format!(
                    "pool {} offers zero pods per node",
                    pool.name
                )));
            }
        }

        let mut workloads = HashSet::new();
        for w in &self.workloads {
            if w.name.is_empty() || w.namespace.is_empty() {
                return Err(FleetError::invalid_topology(
                    "workload with empty name or namespace",
                ));
            }
            if !workloads.insert(w.key()) {
                return Err(FleetError::invalid_topology(format!(
                    "workload {} declared twice",
                    w.key()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taint::{Taint, TaintEffect};

    #[test]
    fn parses_minimal_json() {
        let topo: Topology = serde_json::from_str(
            r#"{
                "pools": [
                    {"name": "ng-standard", "instance_class": "t2.medium", "desired_nodes": 3},
                    {"name": "ng-2xlarge", "instance_class": "t3.2xlarge", "desired_nodes": 3,
                     "taints": [{"key": "nginx", "value": "true", "effect": "NoSchedule"}]}
                ],
                "workloads": [
                    {"name": "nginx-ing-cntlr", "namespace": "apps", "replicas": 3,
                     "tolerations": [{"key": "nginx", "value": "true"}],
                     "preferred_instance_classes": ["t3.2xlarge"]}
                ],
                "tags": {"project": "PulumiEKSUpgrade", "org": "KubeTeam"}
            }"#,
        )
        .unwrap();
        assert!(topo.validate().is_ok());
        assert_eq!(topo.pools[1].taints[0].effect, TaintEffect::NoSchedule);
        assert!(topo.workloads[0].tolerates(&topo.pools[1].taints));
        assert!(topo.workloads[0].prefers("t3.2xlarge"));
    }

    #[test]
    fn duplicate_pool_names_are_rejected() {
        let topo = Topology {
            pools: vec![
                NodePoolSpec::new("ng-1", "t3.large", 1),
                NodePoolSpec::new("ng-1", "t3.xlarge", 1),
            ],
            ..Default::default()
        };
        assert!(matches!(topo.validate(), Err(FleetError::InvalidTopology(_))));
    }

    #[test]
    fn taint_errors_surface_from_validation() {
        let topo = Topology {
            pools: vec![NodePoolSpec::new("ng-1", "t3.large", 1)
                .with_taint(Taint::new("role", "a", TaintEffect::NoSchedule))
                .with_taint(Taint::new("role", "b", TaintEffect::NoSchedule))],
            ..Default::default()
        };
        assert!(matches!(topo.validate(), Err(FleetError::InvalidTaintSet(_))));
        assert!(topo.validate_structure().is_ok());
    }

    #[test]
    fn duplicate_workloads_are_rejected() {
        let topo = Topology {
            workloads: vec![
                WorkloadSpec::new("apps", "echoserver", 3),
                WorkloadSpec::new("apps", "echoserver", 1),
            ],
            ..Default::default()
        };
        assert!(topo.validate().is_err());
    }
}
