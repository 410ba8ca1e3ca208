//! Node-pool lifecycle: Pending → Provisioning → Ready → Draining → Terminated.
//!
//! The provider has no notion of draining; that phase lives only in the
//! manager's table and survives refreshes until the pool is deleted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};

use fleet_common::util::now_ms;
use fleet_common::{
    validate_taints, FleetError, IdentityHandle, NodePoolSpec, PoolHandle, PoolPhase, PoolState,
    PoolStatus, ProviderPhase, Result,
};
use fleet_provider::ClusterProvider;

use crate::retry::{retry_transient, RetryConfig};

pub struct PoolManager {
    provider: Arc<dyn ClusterProvider>,
    states: RwLock<BTreeMap<String, PoolState>>,
    retry: RetryConfig,
    poll_interval: Duration,
}

/// Phase implied by a provider status, given the phase last recorded locally.
fn derive_phase(previous: Option<PoolPhase>, status: &PoolStatus) -> PoolPhase {
    match (status.phase, previous) {
        (ProviderPhase::Deleting | ProviderPhase::Deleted, _) => PoolPhase::Terminated,
        (_, Some(PoolPhase::Terminated)) => PoolPhase::Terminated,
        (_, Some(PoolPhase::Draining)) => PoolPhase::Draining,
        (ProviderPhase::Creating, _) => PoolPhase::Pending,
        (ProviderPhase::Active, _) if status.healthy_nodes >= status.desired_nodes => {
            PoolPhase::Ready
        }
        // A resize in flight does not take a serving pool out of rotation.
        (ProviderPhase::Active, Some(PoolPhase::Ready)) if status.healthy_nodes > 0 => {
            PoolPhase::Ready
        }
        (ProviderPhase::Active, _) => PoolPhase::Provisioning,
    }
}

fn state_from(status: PoolStatus, phase: PoolPhase) -> PoolState {
    let spec = NodePoolSpec {
        desired_nodes: status.desired_nodes,
        ..status.spec
    };
    PoolState {
        name: status.handle.name.clone(),
        phase,
        healthy_nodes: status.healthy_nodes,
        resident_replicas: status.resident_replicas,
        spec,
        identity: status.identity,
        handle: status.handle,
        observed_at_ms: now_ms(),
    }
}

impl PoolManager {
    pub fn new(provider: Arc<dyn ClusterProvider>, retry: RetryConfig, poll_interval: Duration) -> Self {
        Self {
            provider,
            states: RwLock::new(BTreeMap::new()),
            retry,
            poll_interval,
        }
    }

    pub async fn state(&self, name: &str) -> Option<PoolState> {
        self.states.read().await.get(name).cloned()
    }

    pub async fn snapshot(&self) -> Vec<PoolState> {
        self.states.read().await.values().cloned().collect()
    }

    /// Name of a live pool still bound to `identity`.
    pub async fn pool_using_identity(&self, identity: &IdentityHandle) -> Option<String> {
        self.states
            .read()
            .await
            .values()
            .find(|s| s.phase != PoolPhase::Terminated && &s.identity == identity)
            .map(|s| s.name.clone())
    }

    async fn poll_status(&self, handle: &PoolHandle) -> Result<Option<PoolStatus>> {
        let provider = &self.provider;
        retry_transient(&self.retry, "get_pool_status", move || {
            provider.get_pool_status(handle)
        })
        .await
    }

    /// Rebuild the table from the provider's pool list.
    ///
    /// Pools created by this manager but not yet listed are kept, since the
    /// provider's list is eventually consistent.
    pub async fn refresh(&self) -> Result<Vec<PoolState>> {
        let provider = &self.provider;
        let handles =
            retry_transient(&self.retry, "list_node_pools", move || provider.list_node_pools())
                .await?;

        let mut observed = Vec::with_capacity(handles.len());
        for handle in &handles {
            if let Some(status) = self.poll_status(handle).await? {
                observed.push(status);
            }
        }

        let mut states = self.states.write().await;
        let previous = std::mem::take(&mut *states);
        for status in observed {
            let phase = derive_phase(previous.get(&status.handle.name).map(|s| s.phase), &status);
            states.insert(status.handle.name.clone(), state_from(status, phase));
        }
        for (name, state) in previous {
            if !states.contains_key(&name)
                && matches!(state.phase, PoolPhase::Pending | PoolPhase::Provisioning)
            {
                states.insert(name, state);
            }
        }
        debug!(pools = states.len(), "pool table refreshed");
        Ok(states.values().cloned().collect())
    }

    /// Poll one pool and record the result. A pool the provider has
    /// forgotten is recorded as Terminated.
    pub async fn observe(&self, name: &str) -> Result<PoolState> {
        let current = self
            .state(name)
            .await
            .ok_or_else(|| FleetError::PoolNotFound(name.to_string()))?;
        let status = self.poll_status(&current.handle).await?;

        let mut states = self.states.write().await;
        let next = match status {
            Some(status) => {
                let phase = derive_phase(states.get(name).map(|s| s.phase), &status);
                state_from(status, phase)
            }
            None => PoolState {
                phase: PoolPhase::Terminated,
                healthy_nodes: 0,
                resident_replicas: 0,
                observed_at_ms: now_ms(),
                ..current
            },
        };
        states.insert(name.to_string(), next.clone());
        Ok(next)
    }

    /// Request a pool bound to `identity`. Returns the recorded state when a
    /// live pool of that name already exists.
    pub async fn create_pool(&self, spec: &NodePoolSpec, identity: &IdentityHandle) -> Result<PoolState> {
        validate_taints(&spec.taints)?;

        if let Some(existing) = self.state(&spec.name).await {
            if existing.phase != PoolPhase::Terminated {
                debug!(pool=%spec.name, phase=%existing.phase, "pool already known, skipping create");
                return Ok(existing);
            }
        }

        let provider = &self.provider;
        let handle = retry_transient(&self.retry, "create_node_pool", move || {
            provider.create_node_pool(spec, identity)
        })
        .await?;
        info!(
            pool=%spec.name,
            id=%handle.id,
            instance_class=%spec.instance_class,
            nodes=spec.desired_nodes,
            role=%identity.role_name,
            "node pool creation accepted"
        );

        let state = PoolState {
            name: spec.name.clone(),
            phase: PoolPhase::Pending,
            healthy_nodes: 0,
            resident_replicas: 0,
            spec: spec.clone(),
            identity: identity.clone(),
            handle,
            observed_at_ms: now_ms(),
        };
        self.states.write().await.insert(spec.name.clone(), state.clone());
        Ok(state)
    }

    async fn poll_until_ready(&self, name: &str) -> Result<PoolState> {
        loop {
            let state = self.observe(name).await?;
            if state.is_ready() && state.healthy_nodes >= state.spec.desired_nodes {
                return Ok(state);
            }
            if state.phase == PoolPhase::Terminated {
                return Err(FleetError::PoolNotFound(name.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait until every desired node of the pool is healthy.
    pub async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<PoolState> {
        match tokio::time::timeout(timeout, self.poll_until_ready(name)).await {
            Ok(res) => {
                if let Ok(state) = &res {
                    info!(pool=%name, nodes=state.healthy_nodes, "pool ready");
                }
                res
            }
            Err(_) => Err(FleetError::ProvisionTimeout {
                pool: name.to_string(),
                timeout,
            }),
        }
    }

    pub async fn resize(&self, name: &str, nodes: u32) -> Result<PoolState> {
        let state = self
            .state(name)
            .await
            .ok_or_else(|| FleetError::PoolNotFound(name.to_string()))?;
        let provider = &self.provider;
        let handle = &state.handle;
        retry_transient(&self.retry, "set_desired_node_count", move || {
            provider.set_desired_node_count(handle, nodes)
        })
        .await?;
        info!(pool=%name, from=state.spec.desired_nodes, to=nodes, "pool resize requested");

        let mut states = self.states.write().await;
        let entry = states.entry(name.to_string()).or_insert(state);
        entry.spec.desired_nodes = nodes;
        Ok(entry.clone())
    }

    /// Stop scheduling onto the pool. Idempotent.
    pub async fn drain(&self, name: &str) -> Result<PoolState> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(name)
            .ok_or_else(|| FleetError::PoolNotFound(name.to_string()))?;
        match state.phase {
            PoolPhase::Draining | PoolPhase::Terminated => {}
            from => {
                state.phase = PoolPhase::Draining;
                info!(pool=%name, %from, resident=state.resident_replicas, "pool draining");
            }
        }
        Ok(state.clone())
    }

    async fn poll_until_empty(&self, name: &str) -> Result<PoolState> {
        loop {
            let state = self.observe(name).await?;
            if state.resident_replicas == 0 || state.phase == PoolPhase::Terminated {
                return Ok(state);
            }
            debug!(pool=%name, resident=state.resident_replicas, "waiting for pool to empty");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn wait_drained(&self, name: &str, timeout: Duration) -> Result<PoolState> {
        match tokio::time::timeout(timeout, self.poll_until_empty(name)).await {
            Ok(res) => res,
            Err(_) => Err(FleetError::DrainTimeout {
                pool: name.to_string(),
                timeout,
            }),
        }
    }

    /// Release the pool's nodes and remove it. Only a Draining pool with no
    /// resident replicas (re-checked against the provider) may be deleted;
    /// deleting a Terminated or unknown pool is a no-op.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let Some(state) = self.state(name).await else {
            debug!(pool=%name, "delete of unknown pool ignored");
            return Ok(());
        };
        match state.phase {
            PoolPhase::Terminated => return Ok(()),
            PoolPhase::Draining => {}
            phase => {
                return Err(FleetError::PoolNotDrained {
                    pool: name.to_string(),
                    phase: phase.to_string(),
                    resident: state.resident_replicas,
                })
            }
        }

        let fresh = self.observe(name).await?;
        if fresh.phase == PoolPhase::Terminated {
            return Ok(());
        }
        if fresh.resident_replicas > 0 {
            return Err(FleetError::PoolNotDrained {
                pool: name.to_string(),
                phase: fresh.phase.to_string(),
                resident: fresh.resident_replicas,
            });
        }

        let provider = &self.provider;
        let handle = &fresh.handle;
        retry_transient(&self.retry, "set_desired_node_count", move || {
            provider.set_desired_node_count(handle, 0)
        })
        .await?;
        retry_transient(&self.retry, "delete_node_pool", move || {
            provider.delete_node_pool(handle)
        })
        .await?;

        if let Some(s) = self.states.write().await.get_mut(name) {
            s.phase = PoolPhase::Terminated;
            s.healthy_nodes = 0;
            s.observed_at_ms = now_ms();
        }
        info!(pool=%name, id=%fresh.handle.id, "node pool deleted");
        Ok(())
    }
}
