//! Simulated cluster, identity service and scheduler on top of a [`MetaStore`].
//!
//! Every status poll advances the simulated world by one step: pools leave
//! `Creating` after a delay, nodes join (or leave) a few at a time, and
//! replicas become healthy only on active pools with room for them. Records
//! live under the `/fleet/` key layout, so an etcd-backed simulation can be
//! inspected with ordinary etcd tooling.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use fleet_common::util::now_ms;
use fleet_common::{
    FleetError, IdentityHandle, NodePoolSpec, PolicyTemplate, PoolHandle, PoolStatus,
    ProviderPhase, ReplicaHealth, Result, WorkloadKey,
};
use fleet_meta::{keys, MetaStore, MetaStoreExt};

use crate::{ClusterProvider, IdentityService, WorkloadScheduler};

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Status polls a new pool spends in `Creating`.
    pub create_delay_polls: u32,
    /// Nodes joining or leaving per status poll.
    pub nodes_per_poll: u32,
    /// Replicas turning healthy per pool per health poll.
    pub replicas_per_poll: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            create_delay_polls: 1,
            nodes_per_poll: 1,
            replicas_per_poll: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolRecord {
    handle: PoolHandle,
    spec: NodePoolSpec,
    identity: IdentityHandle,
    phase: ProviderPhase,
    desired_nodes: u32,
    healthy_nodes: u32,
    polls: u32,
}

impl PoolRecord {
    fn advance(&mut self, cfg: &SimConfig) {
        self.polls = self.polls.saturating_add(1);
        match self.phase {
            ProviderPhase::Creating => {
                if self.polls > cfg.create_delay_polls {
                    self.phase = ProviderPhase::Active;
                }
            }
            ProviderPhase::Active => {
                let step = cfg.nodes_per_poll.max(1);
                self.healthy_nodes = if self.healthy_nodes < self.desired_nodes {
                    (self.healthy_nodes + step).min(self.desired_nodes)
                } else {
                    self.healthy_nodes.saturating_sub(step).max(self.desired_nodes)
                };
            }
            ProviderPhase::Deleting => {
                self.healthy_nodes = 0;
                self.phase = ProviderPhase::Deleted;
            }
            ProviderPhase::Deleted => {}
        }
    }

    fn capacity(&self) -> u32 {
        if self.phase == ProviderPhase::Active {
            self.healthy_nodes.saturating_mul(self.spec.pods_per_node)
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityRecord {
    handle: IdentityHandle,
    policy: PolicyTemplate,
    created_at_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WorkloadRecord {
    workload: Option<WorkloadKey>,
    #[serde(default)]
    targets: BTreeMap<String, u32>,
    #[serde(default)]
    healthy: BTreeMap<String, u32>,
}

/// One simulated fleet implementing all three collaborator interfaces.
#[derive(Clone)]
pub struct SimFleet {
    store: Arc<dyn MetaStore>,
    cfg: SimConfig,
    faults: Arc<DashMap<String, u32>>,
    calls: Arc<DashMap<String, u32>>,
}

impl SimFleet {
    pub fn new(store: Arc<dyn MetaStore>, cfg: SimConfig) -> Self {
        Self {
            store,
            cfg,
            faults: Arc::new(DashMap::new()),
            calls: Arc::new(DashMap::new()),
        }
    }

    /// Make the next `times` calls of `op` fail with `ProviderUnavailable`.
    pub fn fail_next(&self, op: &str, times: u32) {
        self.faults.insert(op.to_string(), times);
    }

    /// Number of calls made to `op` so far, including injected failures.
    pub fn calls(&self, op: &str) -> u32 {
        self.calls.get(op).map(|c| *c).unwrap_or(0)
    }

    fn enter(&self, op: &str) -> Result<()> {
        *self.calls.entry(op.to_string()).or_insert(0) += 1;
        if let Some(mut remaining) = self.faults.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FleetError::unavailable(format!("injected fault in {op}")));
            }
        }
        Ok(())
    }

    /// Register an existing role, as if created out of band.
    pub async fn seed_identity(&self, role_name: &str) -> Result<IdentityHandle> {
        let handle = IdentityHandle {
            id: format!("sim-role-{}", Uuid::new_v4().simple()),
            role_name: role_name.to_string(),
        };
        let rec = IdentityRecord {
            handle: handle.clone(),
            policy: PolicyTemplate::default(),
            created_at_ms: now_ms(),
        };
        self.store.put_json(&keys::identity_key(role_name), &rec).await?;
        Ok(handle)
    }

    /// Register an active pool with every node healthy.
    pub async fn seed_pool(&self, spec: &NodePoolSpec, identity: &IdentityHandle) -> Result<PoolHandle> {
        let handle = PoolHandle {
            id: format!("np-{}", Uuid::new_v4().simple()),
            name: spec.name.clone(),
        };
        let rec = PoolRecord {
            handle: handle.clone(),
            spec: spec.clone(),
            identity: identity.clone(),
            phase: ProviderPhase::Active,
            desired_nodes: spec.desired_nodes,
            healthy_nodes: spec.desired_nodes,
            polls: 0,
        };
        self.store.put_json(&keys::pool_key(&spec.name), &rec).await?;
        Ok(handle)
    }

    /// Register a workload whose replicas are all healthy.
    pub async fn seed_workload(&self, workload: &WorkloadKey, targets: BTreeMap<String, u32>) -> Result<()> {
        let rec = WorkloadRecord {
            workload: Some(workload.clone()),
            healthy: targets.clone(),
            targets,
        };
        self.store
            .put_json(&keys::workload_key(&workload.namespace, &workload.name), &rec)
            .await?;
        Ok(())
    }

    pub async fn identity_count(&self) -> Result<usize> {
        let roles: Vec<IdentityRecord> = self.store.list_json(keys::IDENTITIES_PREFIX).await?;
        Ok(roles.len())
    }

    async fn pool_records(&self) -> Result<Vec<PoolRecord>> {
        Ok(self.store.list_json(keys::POOLS_PREFIX).await?)
    }

    async fn workload_records(&self) -> Result<Vec<(String, WorkloadRecord)>> {
        let mut out = Vec::new();
        for (key, bytes, _) in self.store.list_prefix(keys::WORKLOADS_PREFIX).await? {
            if let Ok(rec) = serde_json::from_slice::<WorkloadRecord>(&bytes) {
                out.push((key, rec));
            }
        }
        Ok(out)
    }

    async fn resident_on(&self, pool: &str) -> Result<u32> {
        Ok(self
            .workload_records()
            .await?
            .iter()
            .map(|(_, rec)| rec.targets.get(pool).copied().unwrap_or(0))
            .fold(0u32, u32::saturating_add))
    }
}

#[async_trait]
impl ClusterProvider for SimFleet {
    async fn create_node_pool(
        &self,
        spec: &NodePoolSpec,
        identity: &IdentityHandle,
    ) -> Result<PoolHandle> {
        self.enter("create_node_pool")?;
        let key = keys::pool_key(&spec.name);
        let fresh = PoolRecord {
            handle: PoolHandle {
                id: format!("np-{}", Uuid::new_v4().simple()),
                name: spec.name.clone(),
            },
            spec: spec.clone(),
            identity: identity.clone(),
            phase: ProviderPhase::Creating,
            desired_nodes: spec.desired_nodes,
            healthy_nodes: 0,
            polls: 0,
        };
        let created = self
            .store
            .update_json::<PoolRecord, _>(&key, |cur| match cur {
                Some(_) => None,
                None => Some(fresh.clone()),
            })
            .await?;
        if let Some(rec) = created {
            debug!(pool=%spec.name, id=%rec.handle.id, "sim: pool creation accepted");
            return Ok(rec.handle);
        }
        let (existing, _) = self
            .store
            .get_json::<PoolRecord>(&key)
            .await?
            .ok_or_else(|| FleetError::unavailable(format!("pool {} vanished during create", spec.name)))?;
        Ok(existing.handle)
    }

    async fn get_pool_status(&self, handle: &PoolHandle) -> Result<Option<PoolStatus>> {
        self.enter("get_pool_status")?;
        let key = keys::pool_key(&handle.name);
        let cfg = self.cfg.clone();
        let updated = self
            .store
            .update_json::<PoolRecord, _>(&key, |cur| {
                let mut rec = cur.filter(|r| r.handle.id == handle.id)?;
                rec.advance(&cfg);
                Some(rec)
            })
            .await?;
        let Some(rec) = updated else {
            return Ok(None);
        };
        if rec.phase == ProviderPhase::Deleted {
            self.store.delete(&key).await?;
        }
        let resident_replicas = self.resident_on(&handle.name).await?;
        Ok(Some(PoolStatus {
            handle: rec.handle,
            phase: rec.phase,
            spec: rec.spec,
            identity: rec.identity,
            desired_nodes: rec.desired_nodes,
            healthy_nodes: rec.healthy_nodes,
            resident_replicas,
        }))
    }

    async fn set_desired_node_count(&self, handle: &PoolHandle, nodes: u32) -> Result<()> {
        self.enter("set_desired_node_count")?;
        let updated = self
            .store
            .update_json::<PoolRecord, _>(&keys::pool_key(&handle.name), |cur| {
                let mut rec = cur.filter(|r| r.handle.id == handle.id)?;
                rec.desired_nodes = nodes;
                Some(rec)
            })
            .await?;
        match updated {
            Some(_) => Ok(()),
            None => Err(FleetError::PoolNotFound(handle.name.clone())),
        }
    }

    async fn delete_node_pool(&self, handle: &PoolHandle) -> Result<()> {
        self.enter("delete_node_pool")?;
        self.store
            .update_json::<PoolRecord, _>(&keys::pool_key(&handle.name), |cur| {
                let mut rec = cur.filter(|r| r.handle.id == handle.id)?;
                if rec.phase == ProviderPhase::Deleted {
                    return None;
                }
                rec.phase = ProviderPhase::Deleting;
                rec.desired_nodes = 0;
                Some(rec)
            })
            .await?;
        Ok(())
    }

    async fn list_node_pools(&self) -> Result<Vec<PoolHandle>> {
        self.enter("list_node_pools")?;
        Ok(self
            .pool_records()
            .await?
            .into_iter()
            .filter(|r| r.phase != ProviderPhase::Deleted)
            .map(|r| r.handle)
            .collect())
    }
}

#[async_trait]
impl IdentityService for SimFleet {
    async fn create_role(&self, name: &str, policy: &PolicyTemplate) -> Result<IdentityHandle> {
        self.enter("create_role")?;
        let key = keys::identity_key(name);
        let fresh = IdentityRecord {
            handle: IdentityHandle {
                id: format!("sim-role-{}", Uuid::new_v4().simple()),
                role_name: name.to_string(),
            },
            policy: policy.clone(),
            created_at_ms: now_ms(),
        };
        let created = self
            .store
            .update_json::<IdentityRecord, _>(&key, |cur| match cur {
                Some(_) => None,
                None => Some(fresh.clone()),
            })
            .await?;
        match created {
            Some(rec) => Ok(rec.handle),
            None => {
                let (existing, _) = self
                    .store
                    .get_json::<IdentityRecord>(&key)
                    .await?
                    .ok_or_else(|| FleetError::unavailable(format!("role {name} vanished during create")))?;
                Ok(existing.handle)
            }
        }
    }

    async fn delete_role(&self, handle: &IdentityHandle) -> Result<()> {
        self.enter("delete_role")?;
        let key = keys::identity_key(&handle.role_name);
        if let Some((rec, _)) = self.store.get_json::<IdentityRecord>(&key).await? {
            if rec.handle.id == handle.id {
                self.store.delete(&key).await?;
            }
        }
        Ok(())
    }

    async fn find_role(&self, name: &str) -> Result<Option<IdentityHandle>> {
        self.enter("find_role")?;
        Ok(self
            .store
            .get_json::<IdentityRecord>(&keys::identity_key(name))
            .await?
            .map(|(rec, _)| rec.handle))
    }

    async fn list_roles(&self) -> Result<Vec<IdentityHandle>> {
        self.enter("list_roles")?;
        let roles: Vec<IdentityRecord> = self.store.list_json(keys::IDENTITIES_PREFIX).await?;
        Ok(roles.into_iter().map(|rec| rec.handle).collect())
    }
}

#[async_trait]
impl WorkloadScheduler for SimFleet {
    async fn set_replica_targets(
        &self,
        workload: &WorkloadKey,
        targets: &BTreeMap<String, u32>,
    ) -> Result<()> {
        self.enter("set_replica_targets")?;
        let key = keys::workload_key(&workload.namespace, &workload.name);
        self.store
            .update_json::<WorkloadRecord, _>(&key, |cur| {
                let mut rec = cur.unwrap_or_default();
                rec.workload = Some(workload.clone());
                rec.targets = targets
                    .iter()
                    .filter(|(_, n)| **n > 0)
                    .map(|(p, n)| (p.clone(), *n))
                    .collect();
                // Scale-downs take effect immediately.
                let targets = &rec.targets;
                rec.healthy = rec
                    .healthy
                    .iter()
                    .filter_map(|(p, h)| targets.get(p).map(|t| (p.clone(), (*h).min(*t))))
                    .collect();
                Some(rec)
            })
            .await?;
        Ok(())
    }

    async fn get_replica_health(&self, workload: &WorkloadKey) -> Result<ReplicaHealth> {
        self.enter("get_replica_health")?;
        let key = keys::workload_key(&workload.namespace, &workload.name);

        let capacity: BTreeMap<String, u32> = self
            .pool_records()
            .await?
            .into_iter()
            .map(|r| (r.spec.name.clone(), r.capacity()))
            .collect();
        let mut used_by_others: BTreeMap<String, u32> = BTreeMap::new();
        for (k, rec) in self.workload_records().await? {
            if k == key {
                continue;
            }
            for (pool, healthy) in rec.healthy {
                *used_by_others.entry(pool).or_default() += healthy;
            }
        }

        let step = self.cfg.replicas_per_poll.max(1);
        let updated = self
            .store
            .update_json::<WorkloadRecord, _>(&key, |cur| {
                let mut rec = cur?;
                let mut healthy = BTreeMap::new();
                for (pool, target) in &rec.targets {
                    let room = capacity
                        .get(pool)
                        .copied()
                        .unwrap_or(0)
                        .saturating_sub(used_by_others.get(pool).copied().unwrap_or(0));
                    let current = rec.healthy.get(pool).copied().unwrap_or(0);
                    let next = (current + step).min(*target).min(room);
                    if next > 0 {
                        healthy.insert(pool.clone(), next);
                    }
                }
                rec.healthy = healthy;
                Some(rec)
            })
            .await?;

        Ok(match updated {
            Some(rec) => {
                let endpoints_ready = rec.healthy.values().any(|h| *h > 0);
                ReplicaHealth {
                    targets: rec.targets,
                    healthy: rec.healthy,
                    endpoints_ready,
                }
            }
            None => ReplicaHealth::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_meta::MemoryMetaStore;

    fn fleet() -> SimFleet {
        SimFleet::new(Arc::new(MemoryMetaStore::new()), SimConfig::default())
    }

    fn identity() -> IdentityHandle {
        IdentityHandle {
            id: "sim-role-1".into(),
            role_name: "ng-1-node-role".into(),
        }
    }

    #[tokio::test]
    async fn pool_walks_from_creating_to_full_health() {
        let sim = fleet();
        let spec = NodePoolSpec::new("ng-1", "t3.large", 2);
        let handle = sim.create_node_pool(&spec, &identity()).await.unwrap();

        let s = sim.get_pool_status(&handle).await.unwrap().unwrap();
        assert_eq!(s.phase, ProviderPhase::Creating);
        let s = sim.get_pool_status(&handle).await.unwrap().unwrap();
        assert_eq!(s.phase, ProviderPhase::Active);
        assert_eq!(s.healthy_nodes, 0);
        sim.get_pool_status(&handle).await.unwrap();
        let s = sim.get_pool_status(&handle).await.unwrap().unwrap();
        assert_eq!(s.healthy_nodes, 2);
    }

    #[tokio::test]
    async fn create_is_idempotent_by_name() {
        let sim = fleet();
        let spec = NodePoolSpec::new("ng-1", "t3.large", 1);
        let a = sim.create_node_pool(&spec, &identity()).await.unwrap();
        let b = sim.create_node_pool(&spec, &identity()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(sim.list_node_pools().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleted_pool_disappears_after_a_poll() {
        let sim = fleet();
        let spec = NodePoolSpec::new("ng-1", "t3.large", 1);
        let handle = sim.seed_pool(&spec, &identity()).await.unwrap();
        sim.delete_node_pool(&handle).await.unwrap();
        let s = sim.get_pool_status(&handle).await.unwrap().unwrap();
        assert_eq!(s.phase, ProviderPhase::Deleted);
        assert!(sim.get_pool_status(&handle).await.unwrap().is_none());
        assert!(sim.list_node_pools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replicas_only_turn_healthy_where_there_is_room() {
        let sim = fleet();
        let spec = NodePoolSpec::new("ng-1", "t3.large", 1).with_pods_per_node(2);
        sim.seed_pool(&spec, &identity()).await.unwrap();
        let w = WorkloadKey {
            namespace: "apps".into(),
            name: "echoserver".into(),
        };
        sim.set_replica_targets(&w, &BTreeMap::from([("ng-1".to_string(), 3)]))
            .await
            .unwrap();
        let mut health = ReplicaHealth::default();
        for _ in 0..5 {
            health = sim.get_replica_health(&w).await.unwrap();
        }
        assert_eq!(health.total_targets(), 3);
        assert_eq!(health.total_healthy(), 2);
        assert!(health.endpoints_ready);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let sim = fleet();
        sim.fail_next("find_role", 2);
        assert!(sim.find_role("x").await.unwrap_err().is_transient());
        assert!(sim.find_role("x").await.is_err());
        assert!(sim.find_role("x").await.unwrap().is_none());
        assert_eq!(sim.calls("find_role"), 3);
    }
}
