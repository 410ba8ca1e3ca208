//! Replica placement across Ready pools, and surge-style migration between them.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use fleet_common::util::{now_ms, numeric_suffix, saturating_total};
use fleet_common::{FleetError, PlacementState, PoolState, ReplicaHealth, Result, WorkloadKey, WorkloadSpec};
use fleet_provider::WorkloadScheduler;

use crate::retry::{retry_transient, RetryConfig};

/// A pool considered for a workload's replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub pool: String,
    pub instance_class: String,
    /// Free replica slots.
    pub spare: u32,
}

impl Candidate {
    pub fn from_state(state: &PoolState) -> Self {
        Self {
            pool: state.name.clone(),
            instance_class: state.spec.instance_class.clone(),
            spare: state.spare_capacity(),
        }
    }
}

fn suffix_order(a: &str, b: &str) -> Ordering {
    match (numeric_suffix(a), numeric_suffix(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Best first: preferred instance class, then most spare capacity, then the
/// lowest numeric name suffix, then name.
pub fn rank_candidates(workload: &WorkloadSpec, candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        workload
            .prefers(&b.instance_class)
            .cmp(&workload.prefers(&a.instance_class))
            .then(b.spare.cmp(&a.spare))
            .then_with(|| suffix_order(&a.pool, &b.pool))
            .then_with(|| a.pool.cmp(&b.pool))
    });
}

/// Ready pools whose taints the workload tolerates, ranked.
pub fn eligible_pools(workload: &WorkloadSpec, pools: &[PoolState]) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = pools
        .iter()
        .filter(|p| p.is_ready() && workload.tolerates(&p.spec.taints))
        .map(Candidate::from_state)
        .collect();
    rank_candidates(workload, &mut out);
    out
}

/// Spread `needed` replicas over ranked candidates, best first. None if they
/// do not fit.
pub fn fill(needed: u32, ranked: &[Candidate]) -> Option<BTreeMap<String, u32>> {
    let mut out = BTreeMap::new();
    let mut left = needed;
    for c in ranked {
        if left == 0 {
            break;
        }
        let take = c.spare.min(left);
        if take > 0 {
            out.insert(c.pool.clone(), take);
            left -= take;
        }
    }
    (left == 0).then_some(out)
}

/// Result of moving a workload's replicas off one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub moved: u32,
    /// Healthy replicas when the migration started.
    pub baseline_healthy: u32,
    /// Fewest healthy replicas seen at any poll during the migration.
    pub min_healthy: u32,
    pub state: PlacementState,
}

pub struct PlacementCoordinator {
    scheduler: Arc<dyn WorkloadScheduler>,
    states: RwLock<BTreeMap<WorkloadKey, PlacementState>>,
    /// Serializes target changes per workload.
    locks: DashMap<WorkloadKey, Arc<Mutex<()>>>,
    retry: RetryConfig,
    poll_interval: Duration,
    max_surge: u32,
}

impl PlacementCoordinator {
    pub fn new(
        scheduler: Arc<dyn WorkloadScheduler>,
        retry: RetryConfig,
        poll_interval: Duration,
        max_surge: u32,
    ) -> Self {
        Self {
            scheduler,
            states: RwLock::new(BTreeMap::new()),
            locks: DashMap::new(),
            retry,
            poll_interval,
            max_surge: max_surge.max(1),
        }
    }

    pub async fn snapshot(&self) -> Vec<PlacementState> {
        self.states.read().await.values().cloned().collect()
    }

    fn lock(&self, key: &WorkloadKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    async fn health(&self, key: &WorkloadKey) -> Result<ReplicaHealth> {
        let scheduler = &self.scheduler;
        retry_transient(&self.retry, "get_replica_health", move || {
            scheduler.get_replica_health(key)
        })
        .await
    }

    async fn apply(&self, key: &WorkloadKey, targets: &BTreeMap<String, u32>) -> Result<()> {
        let scheduler = &self.scheduler;
        retry_transient(&self.retry, "set_replica_targets", move || {
            scheduler.set_replica_targets(key, targets)
        })
        .await?;
        debug!(workload=%key, ?targets, "replica targets applied");
        Ok(())
    }

    pub async fn observe(&self, workload: &WorkloadSpec) -> Result<PlacementState> {
        let key = workload.key();
        let health = self.health(&key).await?;
        let state = PlacementState::from_health(key.clone(), workload.replicas, &health, now_ms());
        self.states.write().await.insert(key, state.clone());
        Ok(state)
    }

    /// Targets after adding replicas up to the desired count on eligible pools.
    fn grow(&self, workload: &WorkloadSpec, current: &PlacementState, pools: &[PoolState]) -> Result<BTreeMap<String, u32>> {
        let mut targets = current.pools.clone();
        let have = current.total_targets();
        if workload.replicas <= have {
            return Ok(targets);
        }
        let needed = workload.replicas - have;

        let ranked = eligible_pools(workload, pools);
        if ranked.is_empty() {
            return Err(FleetError::unschedulable(
                workload.key().to_string(),
                "no ready pool tolerates its taints",
            ));
        }
        let extra = fill(needed, &ranked).ok_or_else(|| {
            let available = saturating_total(ranked.iter().map(|c| &c.spare));
            FleetError::unschedulable(
                workload.key().to_string(),
                format!("needs {needed} replica slots, {available} free on tolerated ready pools"),
            )
        })?;
        for (pool, n) in extra {
            let slot = targets.entry(pool).or_default();
            *slot = slot.saturating_add(n);
        }
        Ok(targets)
    }

    /// Targets after removing `excess` replicas, worst-ranked pools first.
    fn shrink(&self, workload: &WorkloadSpec, current: &PlacementState, pools: &[PoolState], excess: u32) -> BTreeMap<String, u32> {
        let mut hosting: Vec<Candidate> = current
            .pools
            .keys()
            .map(|name| match pools.iter().find(|p| &p.name == name) {
                Some(state) if state.is_ready() => Candidate::from_state(state),
                _ => Candidate {
                    pool: name.clone(),
                    instance_class: String::new(),
                    spare: 0,
                },
            })
            .collect();
        rank_candidates(workload, &mut hosting);

        let mut targets = current.pools.clone();
        let mut left = excess;
        for c in hosting.iter().rev() {
            if left == 0 {
                break;
            }
            let on_pool = targets.get(&c.pool).copied().unwrap_or(0);
            let take = on_pool.min(left);
            if take == on_pool {
                targets.remove(&c.pool);
            } else {
                targets.insert(c.pool.clone(), on_pool - take);
            }
            left -= take;
        }
        targets
    }

    /// Allocate the workload's replicas across Ready pools it tolerates and
    /// wait for them to turn healthy. Nothing is changed when the replicas
    /// do not fit.
    pub async fn place(&self, workload: &WorkloadSpec, pools: &[PoolState], timeout: Duration) -> Result<PlacementState> {
        let lock = self.lock(&workload.key());
        let _guard = lock.lock().await;
        let current = self.observe(workload).await?;
        let targets = self.grow(workload, &current, pools)?;
        if targets != current.pools {
            self.apply(&workload.key(), &targets).await?;
            info!(workload=%workload.key(), ?targets, "workload placed");
        }
        self.wait_ready(workload, timeout).await
    }

    /// Bring the workload to its desired replica count, growing onto eligible
    /// pools or trimming from the least preferred ones.
    pub async fn scale(&self, workload: &WorkloadSpec, pools: &[PoolState], timeout: Duration) -> Result<PlacementState> {
        let lock = self.lock(&workload.key());
        let _guard = lock.lock().await;
        let current = self.observe(workload).await?;
        let have = current.total_targets();
        let targets = if workload.replicas >= have {
            self.grow(workload, &current, pools)?
        } else {
            self.shrink(workload, &current, pools, have - workload.replicas)
        };
        if targets != current.pools {
            self.apply(&workload.key(), &targets).await?;
            info!(workload=%workload.key(), from=have, to=workload.replicas, "workload scaled");
        }
        self.wait_ready(workload, timeout).await
    }

    async fn poll_until_ready(&self, workload: &WorkloadSpec) -> Result<PlacementState> {
        loop {
            let state = self.observe(workload).await?;
            if state.ready {
                return Ok(state);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn wait_ready(&self, workload: &WorkloadSpec, timeout: Duration) -> Result<PlacementState> {
        match tokio::time::timeout(timeout, self.poll_until_ready(workload)).await {
            Ok(res) => res,
            Err(_) => Err(FleetError::ReadinessTimeout {
                workload: workload.key().to_string(),
                timeout,
            }),
        }
    }

    /// Poll until `done` holds, tracking the fewest healthy replicas seen.
    async fn wait_until(
        &self,
        workload: &WorkloadSpec,
        deadline: Instant,
        timeout: Duration,
        min_healthy: &mut u32,
        done: impl Fn(&PlacementState) -> bool,
    ) -> Result<PlacementState> {
        loop {
            let state = self.observe(workload).await?;
            *min_healthy = (*min_healthy).min(state.total_healthy());
            if done(&state) {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                return Err(FleetError::ReadinessTimeout {
                    workload: workload.key().to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Move every replica of `workload` from `from` onto `to`, at most
    /// `max_surge` at a time. Each batch is added on `to` and confirmed
    /// healthy before the same number is removed from `from`, so healthy
    /// replicas never drop below the starting count. On timeout the added
    /// replicas are left in place.
    pub async fn migrate(
        &self,
        workload: &WorkloadSpec,
        from: &str,
        to: &PoolState,
        timeout: Duration,
    ) -> Result<MigrationOutcome> {
        let key = workload.key();
        let lock = self.lock(&key);
        let _guard = lock.lock().await;
        let current = self.observe(workload).await?;
        let to_move = current.replicas_on(from);
        let baseline = current.total_healthy();
        if to_move == 0 {
            return Ok(MigrationOutcome {
                moved: 0,
                baseline_healthy: baseline,
                min_healthy: baseline,
                state: current,
            });
        }

        let refuse = |reason: String| Err(FleetError::unschedulable(key.to_string(), reason));
        if to.name == from {
            return refuse(format!("cannot migrate from {from} onto itself"));
        }
        if !to.is_ready() {
            return refuse(format!("destination pool {} is {}", to.name, to.phase));
        }
        if !workload.tolerates(&to.spec.taints) {
            return refuse(format!("does not tolerate the taints of pool {}", to.name));
        }
        if to.spare_capacity() < to_move {
            return refuse(format!(
                "pool {} has {} free slots, {to_move} needed",
                to.name,
                to.spare_capacity()
            ));
        }

        info!(workload=%key, %from, to=%to.name, replicas=to_move, "migration started");
        let deadline = Instant::now() + timeout;
        let mut targets = current.pools;
        let mut min_healthy = baseline;
        let mut moved = 0;

        // Targets are re-read before every change so moves never write back a
        // stale map.
        while moved < to_move {
            let batch = self.max_surge.min(to_move - moved);
            let want = targets.get(&to.name).copied().unwrap_or(0).saturating_add(batch);
            targets.insert(to.name.clone(), want);
            self.apply(&key, &targets).await?;

            targets = self
                .wait_until(workload, deadline, timeout, &mut min_healthy, |s| {
                    s.healthy.get(&to.name).copied().unwrap_or(0) >= want
                })
                .await?
                .pools;

            let left_on_from = targets.get(from).copied().unwrap_or(0).saturating_sub(batch);
            if left_on_from == 0 {
                targets.remove(from);
            } else {
                targets.insert(from.to_string(), left_on_from);
            }
            self.apply(&key, &targets).await?;
            moved += batch;
            debug!(workload=%key, moved, total=to_move, "migration batch done");
        }

        let state = self
            .wait_until(workload, deadline, timeout, &mut min_healthy, |s| {
                s.pools
                    .iter()
                    .all(|(p, n)| s.healthy.get(p).copied().unwrap_or(0) >= *n)
            })
            .await?;
        info!(workload=%key, %from, to=%to.name, moved, min_healthy, baseline, "migration finished");
        Ok(MigrationOutcome {
            moved,
            baseline_healthy: baseline,
            min_healthy,
            state,
        })
    }
}
