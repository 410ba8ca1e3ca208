//! Node identities (role plus instance profile), one per pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use fleet_common::{pool_for_role, role_name_for, FleetError, IdentityHandle, PolicyTemplate, Result};
use fleet_provider::IdentityService;

use crate::pool::PoolManager;
use crate::retry::{retry_transient, RetryConfig};

type Slot = Arc<Mutex<Option<IdentityHandle>>>;

/// Issues and revokes node identities.
///
/// Provisioning is idempotent per pool name: concurrent callers for the same
/// pool serialize on a per-pool slot, and a role already present at the
/// provider (found by its derived name) is adopted instead of duplicated.
pub struct IdentityProvisioner {
    service: Arc<dyn IdentityService>,
    policy: PolicyTemplate,
    retry: RetryConfig,
    slots: DashMap<String, Slot>,
}

impl IdentityProvisioner {
    pub fn new(service: Arc<dyn IdentityService>, policy: PolicyTemplate, retry: RetryConfig) -> Self {
        Self {
            service,
            policy,
            retry,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, pool: &str) -> Slot {
        self.slots.entry(pool.to_string()).or_default().clone()
    }

    async fn find(&self, role_name: &str) -> Result<Option<IdentityHandle>> {
        let service = &self.service;
        retry_transient(&self.retry, "find_role", move || service.find_role(role_name)).await
    }

    pub async fn provision(&self, pool: &str, tags: &BTreeMap<String, String>) -> Result<IdentityHandle> {
        let slot = self.slot(pool);
        let mut guard = slot.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }

        let role_name = role_name_for(pool);
        let handle = match self.find(&role_name).await? {
            Some(existing) => {
                info!(%pool, role=%existing.role_name, "adopted existing node identity");
                existing
            }
            None => {
                let policy = self.policy.clone().with_tags(tags.clone());
                let (service, name, policy) = (&self.service, role_name.as_str(), &policy);
                let created = retry_transient(&self.retry, "create_role", move || {
                    service.create_role(name, policy)
                })
                .await?;
                info!(%pool, role=%created.role_name, id=%created.id, "node identity provisioned");
                created
            }
        };

        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Identity previously provisioned for `pool`, falling back to the
    /// provider's role under the derived name.
    pub async fn lookup(&self, pool: &str) -> Result<Option<IdentityHandle>> {
        let slot = self.slots.get(pool).map(|s| s.clone());
        if let Some(slot) = slot {
            let cached = slot.lock().await.clone();
            if cached.is_some() {
                return Ok(cached);
            }
        }
        self.find(&role_name_for(pool)).await
    }

    /// Pools that still own a node role at the provider, by derived name.
    pub async fn owners(&self) -> Result<Vec<(String, IdentityHandle)>> {
        let service = &self.service;
        let roles = retry_transient(&self.retry, "list_roles", move || service.list_roles()).await?;
        Ok(roles
            .into_iter()
            .filter_map(|h| pool_for_role(&h.role_name).map(|pool| (pool.to_string(), h.clone())))
            .collect())
    }

    /// Delete the role. Fails with `IdentityInUse` while any live pool is
    /// still bound to it.
    pub async fn revoke(&self, handle: &IdentityHandle, pools: &PoolManager) -> Result<()> {
        if let Some(pool) = pools.pool_using_identity(handle).await {
            return Err(FleetError::IdentityInUse {
                role_name: handle.role_name.clone(),
                pool,
            });
        }

        let service = &self.service;
        retry_transient(&self.retry, "delete_role", move || service.delete_role(handle)).await?;

        self.slots.retain(|_, slot| {
            slot.try_lock()
                .map(|cached| cached.as_ref() != Some(handle))
                .unwrap_or(true)
        });
        info!(role=%handle.role_name, id=%handle.id, "node identity revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fleet_common::NodePoolSpec;
    use fleet_meta::MemoryMetaStore;
    use fleet_provider::{SimConfig, SimFleet};

    fn setup() -> (SimFleet, IdentityProvisioner, PoolManager) {
        let sim = SimFleet::new(Arc::new(MemoryMetaStore::new()), SimConfig::default());
        let identities = IdentityProvisioner::new(
            Arc::new(sim.clone()),
            PolicyTemplate::default(),
            RetryConfig::fast(4),
        );
        let pools = PoolManager::new(
            Arc::new(sim.clone()),
            RetryConfig::fast(4),
            Duration::from_millis(1),
        );
        (sim, identities, pools)
    }

    #[tokio::test]
    async fn concurrent_provision_creates_one_role() {
        let (sim, identities, _pools) = setup();
        let tags = BTreeMap::from([("project".to_string(), "PulumiEKSUpgrade".to_string())]);

        let handles = futures_util::future::join_all(
            (0..8).map(|_| identities.provision("ng-2xlarge", &tags)),
        )
        .await;

        let first = handles[0].clone().unwrap();
        assert_eq!(first.role_name, "ng-2xlarge-node-role");
        for h in handles {
            assert_eq!(h.unwrap(), first);
        }
        assert_eq!(sim.calls("create_role"), 1);
        assert_eq!(sim.identity_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn existing_role_is_adopted() {
        let (sim, identities, _pools) = setup();
        let seeded = sim.seed_identity("ng-standard-node-role").await.unwrap();

        let handle = identities
            .provision("ng-standard", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(handle, seeded);
        assert_eq!(sim.calls("create_role"), 0);
    }

    #[tokio::test]
    async fn revoke_refuses_identity_bound_to_live_pool() {
        let (sim, identities, pools) = setup();
        let handle = identities.provision("ng-1", &BTreeMap::new()).await.unwrap();
        pools
            .create_pool(&NodePoolSpec::new("ng-1", "t3.large", 1), &handle)
            .await
            .unwrap();

        let err = identities.revoke(&handle, &pools).await.unwrap_err();
        assert!(matches!(err, FleetError::IdentityInUse { ref pool, .. } if pool == "ng-1"));
        assert_eq!(sim.identity_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn revoke_forgets_cached_handle() {
        let (sim, identities, pools) = setup();
        let handle = identities.provision("ng-old", &BTreeMap::new()).await.unwrap();

        identities.revoke(&handle, &pools).await.unwrap();
        assert_eq!(sim.identity_count().await.unwrap(), 0);
        assert!(identities.lookup("ng-old").await.unwrap().is_none());

        // A later provision issues a fresh role.
        let again = identities.provision("ng-old", &BTreeMap::new()).await.unwrap();
        assert_ne!(again.id, handle.id);
    }

    #[tokio::test]
    async fn owners_skip_roles_with_foreign_names() {
        let (sim, identities, _pools) = setup();
        let ours = sim.seed_identity("ng-old-node-role").await.unwrap();
        sim.seed_identity("ci-runner").await.unwrap();
        sim.fail_next("list_roles", 1);

        let owners = identities.owners().await.unwrap();
        assert_eq!(owners, vec![("ng-old".to_string(), ours)]);
    }

    #[tokio::test]
    async fn throttled_create_is_retried() {
        let (sim, identities, _pools) = setup();
        sim.fail_next("create_role", 2);
        identities.provision("ng-1", &BTreeMap::new()).await.unwrap();
        assert_eq!(sim.calls("create_role"), 3);
        assert_eq!(sim.identity_count().await.unwrap(), 1);
    }
}
