//! Interfaces to the systems the orchestrator drives but does not own:
//! the cluster's node-pool API, the cloud identity service, and the
//! workload scheduler.

use std::collections::BTreeMap;

use async_trait::async_trait;

use fleet_common::{
    IdentityHandle, NodePoolSpec, PolicyTemplate, PoolHandle, PoolStatus, ReplicaHealth, Result,
    WorkloadKey,
};

pub mod sim;

pub use sim::{SimConfig, SimFleet};

/// Node-pool API of the managed cluster. Eventually consistent; status polling
/// is the only way to observe progress.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Create a pool bound to `identity`. Creating a pool whose name already
    /// exists returns the existing handle.
    async fn create_node_pool(
        &self,
        spec: &NodePoolSpec,
        identity: &IdentityHandle,
    ) -> Result<PoolHandle>;

    /// None once the provider no longer knows the pool.
    async fn get_pool_status(&self, handle: &PoolHandle) -> Result<Option<PoolStatus>>;

    async fn set_desired_node_count(&self, handle: &PoolHandle, nodes: u32) -> Result<()>;

    async fn delete_node_pool(&self, handle: &PoolHandle) -> Result<()>;

    async fn list_node_pools(&self) -> Result<Vec<PoolHandle>>;
}

/// Cloud identity service issuing node roles.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn create_role(&self, name: &str, policy: &PolicyTemplate) -> Result<IdentityHandle>;

    async fn delete_role(&self, handle: &IdentityHandle) -> Result<()>;

    async fn find_role(&self, name: &str) -> Result<Option<IdentityHandle>>;

    async fn list_roles(&self) -> Result<Vec<IdentityHandle>>;
}

/// Scheduler applying per-pool replica targets and reporting replica health.
#[async_trait]
pub trait WorkloadScheduler: Send + Sync {
    /// Replace the workload's per-pool targets. Pools absent from `targets`
    /// are scaled to zero.
    async fn set_replica_targets(
        &self,
        workload: &WorkloadKey,
        targets: &BTreeMap<String, u32>,
    ) -> Result<()>;

    async fn get_replica_health(&self, workload: &WorkloadKey) -> Result<ReplicaHealth>;
}
