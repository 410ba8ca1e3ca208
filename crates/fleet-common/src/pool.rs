use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::IdentityHandle;
use crate::taint::Taint;

/// Desired state of one node pool.
///
/// Immutable once handed to the orchestrator for a generation; a different
/// instance class or taint set requires a new pool name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodePoolSpec {
    /// Unique pool name, e.g. "ng-2xlarge".
    pub name: String,

    /// Machine type backing every node, e.g. "t3.2xlarge".
    pub instance_class: String,

    /// Desired node count.
    pub desired_nodes: u32,

    /// Scheduling taints applied to every node, in declaration order.
    #[serde(default)]
    pub taints: Vec<Taint>,

    /// Replica slots offered by each healthy node.
    #[serde(default = "default_pods_per_node")]
    pub pods_per_node: u32,

    /// Node image identifier. None lets the provider pick its default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Resource tags propagated to the provider.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_pods_per_node() -> u32 {
    8
}

impl NodePoolSpec {
    pub fn new(name: impl Into<String>, instance_class: impl Into<String>, desired_nodes: u32) -> Self {
        Self {
            name: name.into(),
            instance_class: instance_class.into(),
            desired_nodes,
            taints: Vec::new(),
            pods_per_node: default_pods_per_node(),
            image: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.taints.push(taint);
        self
    }

    pub fn with_pods_per_node(mut self, pods_per_node: u32) -> Self {
        self.pods_per_node = pods_per_node;
        self
    }

    /// Replica slots once every desired node is healthy.
    pub fn full_capacity(&self) -> u32 {
        self.desired_nodes.saturating_mul(self.pods_per_node)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PoolPhase {
    Pending,
    Provisioning,
    Ready,
    Draining,
    Terminated,
}

impl fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolPhase::Pending => "pending",
            PoolPhase::Provisioning => "provisioning",
            PoolPhase::Ready => "ready",
            PoolPhase::Draining => "draining",
            PoolPhase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Provider-side reference to a materialized pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolHandle {
    pub id: String,
    pub name: String,
}

/// Provider's lifecycle view of a pool. Draining is not a provider concept.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPhase {
    Creating,
    Active,
    Deleting,
    Deleted,
}

/// One status poll of a pool, as reported by the cluster provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub handle: PoolHandle,
    pub phase: ProviderPhase,
    pub spec: NodePoolSpec,
    pub identity: IdentityHandle,
    pub desired_nodes: u32,
    pub healthy_nodes: u32,
    /// Workload replicas currently scheduled on the pool's nodes.
    pub resident_replicas: u32,
}

/// Observed runtime state of a pool, owned by the pool lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolState {
    pub name: String,
    pub phase: PoolPhase,
    pub healthy_nodes: u32,
    pub resident_replicas: u32,
    pub spec: NodePoolSpec,
    pub identity: IdentityHandle,
    pub handle: PoolHandle,
    /// Last observation, ms since epoch.
    #[serde(default)]
    pub observed_at_ms: u64,
}

impl PoolState {
    pub fn capacity(&self) -> u32 {
        self.healthy_nodes.saturating_mul(self.spec.pods_per_node)
    }

    pub fn spare_capacity(&self) -> u32 {
        self.capacity().saturating_sub(self.resident_replicas)
    }

    pub fn is_ready(&self) -> bool {
        self.phase == PoolPhase::Ready
    }
}
