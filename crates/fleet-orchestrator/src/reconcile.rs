//! Observe → plan → execute, one reconciliation at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use fleet_common::{
    validate_taints, FleetError, MigrationPlan, MigrationReport, MigrationStep, NodePoolSpec,
    PlacementState, PlannedStep, PoolState, Result, RunError, SkipReason, StepOutcome, StepReport,
    Topology, WorkloadKey, WorkloadSpec,
};
use fleet_provider::{ClusterProvider, IdentityService, WorkloadScheduler};

use crate::config::OrchestratorConfig;
use crate::identity::IdentityProvisioner;
use crate::metrics::SharedMetrics;
use crate::placement::PlacementCoordinator;
use crate::planner::build_plan;
use crate::pool::PoolManager;

pub struct Orchestrator {
    identities: IdentityProvisioner,
    pools: PoolManager,
    placements: PlacementCoordinator,
    config: OrchestratorConfig,
    metrics: Arc<SharedMetrics>,
    run_lock: Mutex<()>,
    last_report: RwLock<Option<MigrationReport>>,
}

/// Fleet state read at the start of a run.
struct Observation {
    pools: Vec<PoolState>,
    placements: BTreeMap<WorkloadKey, PlacementState>,
    role_owners: BTreeSet<String>,
}

impl Observation {
    fn plan(&self, target: &Topology) -> MigrationPlan {
        build_plan(target, &self.pools, &self.placements, &self.role_owners)
    }
}

fn describe_targets(targets: &BTreeMap<String, u32>) -> String {
    targets
        .iter()
        .map(|(pool, n)| format!("{pool}={n}"))
        .collect::<Vec<_>>()
        .join(",")
}

impl Orchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterProvider>,
        identity: Arc<dyn IdentityService>,
        scheduler: Arc<dyn WorkloadScheduler>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            identities: IdentityProvisioner::new(identity, config.policy.clone(), config.retry.clone()),
            pools: PoolManager::new(cluster, config.retry.clone(), config.poll_interval),
            placements: PlacementCoordinator::new(
                scheduler,
                config.retry.clone(),
                config.poll_interval,
                config.max_surge,
            ),
            config,
            metrics: Arc::new(SharedMetrics::default()),
            run_lock: Mutex::new(()),
            last_report: RwLock::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SharedMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<SharedMetrics> {
        self.metrics.clone()
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    pub fn placements(&self) -> &PlacementCoordinator {
        &self.placements
    }

    pub async fn last_report(&self) -> Option<MigrationReport> {
        self.last_report.read().await.clone()
    }

    async fn observe(&self, target: &Topology) -> Result<Observation> {
        let pools = self.pools.refresh().await?;
        let mut placements = BTreeMap::new();
        for w in &target.workloads {
            placements.insert(w.key(), self.placements.observe(w).await?);
        }
        let role_owners = self
            .identities
            .owners()
            .await?
            .into_iter()
            .map(|(pool, _)| pool)
            .collect();
        let ready = pools.iter().filter(|p| p.is_ready()).count() as u64;
        self.metrics.pools_ready.store(ready, Ordering::Relaxed);
        Ok(Observation {
            pools,
            placements,
            role_owners,
        })
    }

    /// Plan against the current observation without executing anything.
    pub async fn plan(&self, target: &Topology) -> Result<MigrationPlan> {
        target.validate_structure()?;
        Ok(self.observe(target).await?.plan(target))
    }

    pub async fn reconcile(&self, target: &Topology) -> MigrationReport {
        self.reconcile_until(target, &CancellationToken::new()).await
    }

    /// Converge toward `target`. Runs are serialized; a run waits for the
    /// previous one to finish. Cancellation lets in-flight steps complete and
    /// skips everything not yet started.
    pub async fn reconcile_until(&self, target: &Topology, cancel: &CancellationToken) -> MigrationReport {
        let _run = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id);
        self.run(run_id, target, cancel).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, target: &Topology, cancel: &CancellationToken) -> MigrationReport {
        let started_at = Utc::now();
        self.metrics.reconcile_total.fetch_add(1, Ordering::Relaxed);

        let planned = match target.validate_structure() {
            Ok(()) => self.observe(target).await.map(|o| o.plan(target)),
            Err(e) => Err(e),
        };
        let (steps, error) = match planned {
            Ok(plan) => {
                info!(steps = plan.len(), "migration plan built");
                (self.execute(&plan, target, cancel).await, None)
            }
            Err(e) => {
                warn!(error=%e, "reconcile aborted before planning");
                (Vec::new(), Some(RunError::from(&e)))
            }
        };

        let cancelled = steps.iter().any(|s| {
            matches!(
                s.outcome,
                StepOutcome::Skipped {
                    reason: SkipReason::Cancelled
                }
            )
        });
        let report = MigrationReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            error,
            steps,
        };
        self.metrics.record_report(&report);
        info!(
            converged = report.is_converged(),
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            skipped = report.skipped().count(),
            "reconcile finished"
        );
        *self.last_report.write().await = Some(report.clone());
        report
    }

    /// Run the plan as a dependency graph: each step starts as soon as all
    /// of its dependencies have succeeded, independent of unrelated steps
    /// still in flight. A failed or skipped step skips its dependents and
    /// nothing else. Once `cancel` fires no new step starts; running steps
    /// finish and the rest are reported cancelled.
    async fn execute<'a>(
        &'a self,
        plan: &'a MigrationPlan,
        target: &'a Topology,
        cancel: &CancellationToken,
    ) -> Vec<StepReport> {
        let mut outcomes: Vec<Option<(StepOutcome, u64)>> = vec![None; plan.len()];
        let mut started = vec![false; plan.len()];
        let mut running = FuturesUnordered::new();
        let launch = move |step: &'a PlannedStep| async move { (step.id, self.run_timed(step, target).await) };
        let succeeded = |outcomes: &[Option<(StepOutcome, u64)>], id: usize| {
            matches!(&outcomes[id], Some((o, _)) if o.is_success())
        };
        let mut cancel_logged = false;

        loop {
            // Dependencies always precede dependents, so one ordered pass
            // propagates skips down whole chains.
            for step in &plan.steps {
                if started[step.id] || outcomes[step.id].is_some() {
                    continue;
                }
                let blocked = step
                    .depends_on
                    .iter()
                    .copied()
                    .find(|d| outcomes[*d].is_some() && !succeeded(&outcomes, *d));
                if let Some(dep) = blocked {
                    outcomes[step.id] = Some((
                        StepOutcome::Skipped {
                            reason: SkipReason::DependencyFailed { step: dep },
                        },
                        0,
                    ));
                }
            }

            if cancel.is_cancelled() {
                if !cancel_logged {
                    warn!(
                        pending = outcomes.iter().filter(|o| o.is_none()).count(),
                        "reconcile cancelled"
                    );
                    cancel_logged = true;
                }
            } else {
                for step in &plan.steps {
                    if started[step.id] || outcomes[step.id].is_some() {
                        continue;
                    }
                    if step.depends_on.iter().all(|d| succeeded(&outcomes, *d)) {
                        started[step.id] = true;
                        running.push(launch(step));
                    }
                }
            }

            let Some((id, result)) = running.next().await else {
                break;
            };
            outcomes[id] = Some(result);
        }

        plan.steps
            .iter()
            .map(|s| {
                let (outcome, elapsed) = outcomes[s.id].take().unwrap_or((
                    StepOutcome::Skipped {
                        reason: SkipReason::Cancelled,
                    },
                    0,
                ));
                StepReport::new(s, outcome, elapsed)
            })
            .collect()
    }

    async fn run_timed(&self, planned: &PlannedStep, target: &Topology) -> (StepOutcome, u64) {
        let started = Instant::now();
        let span = info_span!("step", id = planned.id, step = %planned.step);
        let result = self.run_step(&planned.step, target).instrument(span).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(detail) => {
                info!(id = planned.id, step = %planned.step, elapsed_ms, "step succeeded");
                (StepOutcome::succeeded(detail), elapsed_ms)
            }
            Err(e) => {
                warn!(id = planned.id, step = %planned.step, elapsed_ms, error = %e, "step failed");
                (StepOutcome::failed(&e), elapsed_ms)
            }
        }
    }

    fn target_pool<'t>(target: &'t Topology, pool: &str) -> Result<&'t NodePoolSpec> {
        target
            .pool(pool)
            .ok_or_else(|| FleetError::invalid_topology(format!("pool {pool} is not in the target")))
    }

    fn target_workload<'t>(target: &'t Topology, key: &WorkloadKey) -> Result<&'t WorkloadSpec> {
        target
            .workloads
            .iter()
            .find(|w| w.namespace == key.namespace && w.name == key.name)
            .ok_or_else(|| FleetError::invalid_topology(format!("workload {key} is not in the target")))
    }

    async fn run_step(&self, step: &MigrationStep, target: &Topology) -> Result<Option<String>> {
        let cfg = &self.config;
        match step {
            MigrationStep::ProvisionIdentity { pool } => {
                // A bad taint set fails here, before any identity exists.
                validate_taints(&Self::target_pool(target, pool)?.taints)?;
                let handle = self.identities.provision(pool, &target.tags).await?;
                Ok(Some(format!("role {} ({})", handle.role_name, handle.id)))
            }
            MigrationStep::CreatePool { pool } => {
                let spec = Self::target_pool(target, pool)?;
                let identity = self.identities.provision(pool, &target.tags).await?;
                let state = self.pools.create_pool(spec, &identity).await?;
                Ok(Some(format!("pool handle {}", state.handle.id)))
            }
            MigrationStep::AwaitPoolReady { pool } => {
                let state = self.pools.wait_ready(pool, cfg.provision_timeout).await?;
                Ok(Some(format!("{} nodes healthy", state.healthy_nodes)))
            }
            MigrationStep::ResizePool { pool, to, .. } => {
                self.pools.resize(pool, *to).await?;
                let state = self.pools.wait_ready(pool, cfg.provision_timeout).await?;
                Ok(Some(format!("{} nodes healthy", state.healthy_nodes)))
            }
            MigrationStep::RejectPoolChange { pool, field } => Err(FleetError::ImmutablePoolSpec {
                pool: pool.clone(),
                field: field.clone(),
            }),
            MigrationStep::PlaceWorkload { workload } => {
                let spec = Self::target_workload(target, workload)?;
                let pools = self.pools.snapshot().await;
                let state = self.placements.place(spec, &pools, cfg.readiness_timeout).await?;
                Ok(Some(describe_targets(&state.pools)))
            }
            MigrationStep::ScaleWorkload { workload, .. } => {
                let spec = Self::target_workload(target, workload)?;
                let pools = self.pools.snapshot().await;
                let state = self.placements.scale(spec, &pools, cfg.readiness_timeout).await?;
                Ok(Some(describe_targets(&state.pools)))
            }
            MigrationStep::MigrateWorkload {
                workload,
                from_pool,
                to_pool,
                ..
            } => {
                let spec = Self::target_workload(target, workload)?;
                let Some(to_pool) = to_pool else {
                    return Err(FleetError::unschedulable(
                        workload.to_string(),
                        format!("no surviving pool tolerates it; replicas stay on {from_pool}"),
                    ));
                };
                let dest = self.pools.observe(to_pool).await?;
                let outcome = self
                    .placements
                    .migrate(spec, from_pool, &dest, cfg.readiness_timeout)
                    .await?;
                self.metrics.migrations_total.fetch_add(1, Ordering::Relaxed);
                Ok(Some(format!(
                    "moved {} replicas, min healthy {} (baseline {})",
                    outcome.moved, outcome.min_healthy, outcome.baseline_healthy
                )))
            }
            MigrationStep::DrainPool { pool } => {
                self.pools.drain(pool).await?;
                self.pools.wait_drained(pool, cfg.drain_timeout).await?;
                Ok(None)
            }
            MigrationStep::DeletePool { pool } => {
                self.pools.delete(pool).await?;
                Ok(None)
            }
            MigrationStep::RevokeIdentity { pool } => {
                let handle = match self.pools.state(pool).await {
                    Some(state) => Some(state.identity),
                    None => self.identities.lookup(pool).await?,
                };
                match handle {
                    Some(handle) => {
                        self.identities.revoke(&handle, &self.pools).await?;
                        Ok(Some(format!("role {} deleted", handle.role_name)))
                    }
                    None => Ok(Some("no identity left to revoke".to_string())),
                }
            }
        }
    }
}
