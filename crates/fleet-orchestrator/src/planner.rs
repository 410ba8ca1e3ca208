//! Pure diff of a target topology against the observed fleet.
//!
//! Output is deterministic for a given input: pools are visited in
//! declaration order, workloads and leaving pools in key order.

use std::collections::{BTreeMap, BTreeSet};

use fleet_common::{
    MigrationPlan, MigrationStep, NodePoolSpec, PlacementState, PoolPhase, PoolState, Taint,
    Topology, WorkloadKey, WorkloadSpec,
};

use crate::placement::{rank_candidates, Candidate};

/// A target pool replicas may land on once the plan has run.
struct Usable<'a> {
    spec: &'a NodePoolSpec,
    /// Step after which the pool is Ready, if it is not Ready already.
    ready_step: Option<usize>,
    /// Estimated free replica slots.
    spare: u32,
}

fn same_taints(a: &[Taint], b: &[Taint]) -> bool {
    a.len() == b.len() && a.iter().all(|t| b.contains(t))
}

/// Field of an existing pool that the target tries to change in place.
fn immutable_change(observed: &PoolState, target: &NodePoolSpec) -> Option<&'static str> {
    if observed.spec.instance_class != target.instance_class {
        Some("instance_class")
    } else if !same_taints(&observed.spec.taints, &target.taints) {
        Some("taints")
    } else if observed.phase == PoolPhase::Draining {
        Some("lifecycle (pool is draining)")
    } else {
        None
    }
}

/// Best surviving pool for `replicas` replicas leaving `from`, debiting the
/// estimate of the pool chosen.
fn choose_destination(
    workload: &WorkloadSpec,
    from: &str,
    replicas: u32,
    usable: &mut BTreeMap<&str, Usable<'_>>,
) -> Option<String> {
    let mut candidates: Vec<Candidate> = usable
        .iter()
        .filter(|(name, u)| *name != &from && workload.tolerates(&u.spec.taints))
        .map(|(name, u)| Candidate {
            pool: name.to_string(),
            instance_class: u.spec.instance_class.clone(),
            spare: u.spare,
        })
        .collect();
    rank_candidates(workload, &mut candidates);

    // Prefer a pool with room; otherwise name the best one and let execution
    // report the shortfall.
    let chosen = candidates
        .iter()
        .find(|c| c.spare >= replicas)
        .or_else(|| candidates.first())?
        .pool
        .clone();
    if let Some(u) = usable.get_mut(chosen.as_str()) {
        u.spare = u.spare.saturating_sub(replicas);
    }
    Some(chosen)
}

/// Diff `target` against the observed pools and placements.
///
/// Pools are created before anything is placed on them; every workload
/// resident on a leaving pool is migrated before that pool drains; a pool is
/// deleted only after it drains and its identity is revoked only after the
/// pool is gone. `role_owners` names the pools that still hold a node role
/// at the provider; a role whose pool is neither observed nor declared is
/// revoked on its own. When the target already matches the observation the
/// plan is empty.
pub fn build_plan(
    target: &Topology,
    pools: &[PoolState],
    placements: &BTreeMap<WorkloadKey, PlacementState>,
    role_owners: &BTreeSet<String>,
) -> MigrationPlan {
    let mut plan = MigrationPlan::default();

    let observed: BTreeMap<&str, &PoolState> = pools
        .iter()
        .filter(|p| p.phase != PoolPhase::Terminated)
        .map(|p| (p.name.as_str(), p))
        .collect();

    let mut usable: BTreeMap<&str, Usable<'_>> = BTreeMap::new();
    let mut rejected: BTreeSet<&str> = BTreeSet::new();

    for spec in &target.pools {
        let name = spec.name.as_str();
        let Some(state) = observed.get(name) else {
            let identity = plan.push(
                MigrationStep::ProvisionIdentity {
                    pool: spec.name.clone(),
                },
                vec![],
            );
            let create = plan.push(
                MigrationStep::CreatePool {
                    pool: spec.name.clone(),
                },
                vec![identity],
            );
            let ready = plan.push(
                MigrationStep::AwaitPoolReady {
                    pool: spec.name.clone(),
                },
                vec![create],
            );
            usable.insert(
                name,
                Usable {
                    spec,
                    ready_step: Some(ready),
                    spare: spec.full_capacity(),
                },
            );
            continue;
        };

        if let Some(field) = immutable_change(state, spec) {
            plan.push(
                MigrationStep::RejectPoolChange {
                    pool: spec.name.clone(),
                    field: field.to_string(),
                },
                vec![],
            );
            rejected.insert(name);
            continue;
        }

        let resize = (state.spec.desired_nodes != spec.desired_nodes).then(|| {
            plan.push(
                MigrationStep::ResizePool {
                    pool: spec.name.clone(),
                    from: state.spec.desired_nodes,
                    to: spec.desired_nodes,
                },
                vec![],
            )
        });
        let ready_step = if state.is_ready() {
            resize
        } else {
            Some(plan.push(
                MigrationStep::AwaitPoolReady {
                    pool: spec.name.clone(),
                },
                resize.into_iter().collect(),
            ))
        };
        usable.insert(
            name,
            Usable {
                spec,
                ready_step,
                spare: spec.full_capacity().saturating_sub(state.resident_replicas),
            },
        );
    }

    let leaving: BTreeSet<&str> = observed
        .keys()
        .copied()
        .filter(|name| target.pool(name).is_none())
        .collect();
    let mut migrations_off: BTreeMap<String, Vec<usize>> = BTreeMap::new();

    let mut workloads: Vec<&WorkloadSpec> = target.workloads.iter().collect();
    workloads.sort_by_key(|w| w.key());

    for w in workloads {
        let key = w.key();
        let ready_deps: Vec<usize> = usable
            .values()
            .filter(|u| w.tolerates(&u.spec.taints))
            .filter_map(|u| u.ready_step)
            .collect();

        let Some(current) = placements.get(&key).filter(|p| p.is_placed()) else {
            if w.replicas > 0 {
                plan.push(MigrationStep::PlaceWorkload { workload: key }, ready_deps);
            }
            continue;
        };

        let mut moves = Vec::new();
        for (pool, &replicas) in &current.pools {
            let must_move = match usable.get(pool.as_str()) {
                Some(u) => !w.tolerates(&u.spec.taints),
                // Replicas on a conflicting pool stay where they are.
                None => !rejected.contains(pool.as_str()),
            };
            if !must_move || replicas == 0 {
                continue;
            }
            let to_pool = choose_destination(w, pool, replicas, &mut usable);
            // Moves of one workload run one after another; each rewrites
            // the workload's full target map.
            let deps = to_pool
                .as_deref()
                .and_then(|to| usable.get(to))
                .and_then(|u| u.ready_step)
                .into_iter()
                .chain(moves.last().copied())
                .collect();
            let id = plan.push(
                MigrationStep::MigrateWorkload {
                    workload: key.clone(),
                    from_pool: pool.clone(),
                    to_pool,
                    replicas,
                },
                deps,
            );
            migrations_off.entry(pool.clone()).or_default().push(id);
            moves.push(id);
        }

        let total = current.total_targets();
        if total != w.replicas {
            let mut deps = moves;
            deps.extend(ready_deps);
            deps.sort_unstable();
            plan.push(
                MigrationStep::ScaleWorkload {
                    workload: key,
                    from: total,
                    to: w.replicas,
                },
                deps,
            );
        }
    }

    for pool in leaving {
        let drain = plan.push(
            MigrationStep::DrainPool {
                pool: pool.to_string(),
            },
            migrations_off.remove(pool).unwrap_or_default(),
        );
        let delete = plan.push(
            MigrationStep::DeletePool {
                pool: pool.to_string(),
            },
            vec![drain],
        );
        plan.push(
            MigrationStep::RevokeIdentity {
                pool: pool.to_string(),
            },
            vec![delete],
        );
    }

    // Roles left behind by an earlier run whose revoke failed after the pool
    // was deleted.
    for pool in role_owners {
        let name = pool.as_str();
        if observed.contains_key(name) || target.pool(name).is_some() {
            continue;
        }
        plan.push(MigrationStep::RevokeIdentity { pool: pool.clone() }, vec![]);
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::{IdentityHandle, PlannedStep, PoolHandle, TaintEffect, Toleration};

    fn observed_pool(spec: NodePoolSpec, resident: u32) -> PoolState {
        PoolState {
            name: spec.name.clone(),
            phase: PoolPhase::Ready,
            healthy_nodes: spec.desired_nodes,
            resident_replicas: resident,
            identity: IdentityHandle {
                id: format!("role-{}", spec.name),
                role_name: format!("{}-node-role", spec.name),
            },
            handle: PoolHandle {
                id: format!("np-{}", spec.name),
                name: spec.name.clone(),
            },
            spec,
            observed_at_ms: 0,
        }
    }

    fn placed(w: &WorkloadSpec, on: &[(&str, u32)]) -> (WorkloadKey, PlacementState) {
        let pools: BTreeMap<String, u32> = on.iter().map(|(p, n)| (p.to_string(), *n)).collect();
        let state = PlacementState {
            workload: w.key(),
            desired_replicas: w.replicas,
            healthy: pools.clone(),
            pools,
            ready: true,
            observed_at_ms: 0,
        };
        (w.key(), state)
    }

    fn nginx_taint() -> Taint {
        Taint::new("nginx", "true", TaintEffect::NoSchedule)
    }

    fn nginx() -> WorkloadSpec {
        WorkloadSpec::new("apps", "nginx-ing-cntlr", 3)
            .with_toleration(Toleration::equal("nginx", "true"))
            .prefer_instance_class("t3.2xlarge")
    }

    /// Plan with no leftover node roles at the provider.
    fn plan_for(
        target: &Topology,
        pools: &[PoolState],
        placements: &BTreeMap<WorkloadKey, PlacementState>,
    ) -> MigrationPlan {
        build_plan(target, pools, placements, &BTreeSet::new())
    }

    fn kinds(plan: &MigrationPlan) -> Vec<(MigrationStep, Vec<usize>)> {
        plan.steps
            .iter()
            .map(|s| (s.step.clone(), s.depends_on.clone()))
            .collect()
    }

    #[test]
    fn ingress_moves_to_new_tainted_pool() {
        let old = NodePoolSpec::new("ng-old", "t2.medium", 3);
        let target = Topology {
            pools: vec![NodePoolSpec::new("ng-2xlarge", "t3.2xlarge", 3).with_taint(nginx_taint())],
            workloads: vec![nginx()],
            ..Default::default()
        };
        let pools = vec![observed_pool(old, 3)];
        let placements = BTreeMap::from([placed(&nginx(), &[("ng-old", 3)])]);

        let plan = plan_for(&target, &pools, &placements);
        let nginx_key = nginx().key();
        assert_eq!(
            kinds(&plan),
            vec![
                (MigrationStep::ProvisionIdentity { pool: "ng-2xlarge".into() }, vec![]),
                (MigrationStep::CreatePool { pool: "ng-2xlarge".into() }, vec![0]),
                (MigrationStep::AwaitPoolReady { pool: "ng-2xlarge".into() }, vec![1]),
                (
                    MigrationStep::MigrateWorkload {
                        workload: nginx_key,
                        from_pool: "ng-old".into(),
                        to_pool: Some("ng-2xlarge".into()),
                        replicas: 3,
                    },
                    vec![2]
                ),
                (MigrationStep::DrainPool { pool: "ng-old".into() }, vec![3]),
                (MigrationStep::DeletePool { pool: "ng-old".into() }, vec![4]),
                (MigrationStep::RevokeIdentity { pool: "ng-old".into() }, vec![5]),
            ]
        );
    }

    #[test]
    fn matching_target_yields_empty_plan() {
        let standard = NodePoolSpec::new("ng-standard", "t2.medium", 3);
        let big = NodePoolSpec::new("ng-2xlarge", "t3.2xlarge", 3).with_taint(nginx_taint());
        let echo = WorkloadSpec::new("apps", "echoserver", 3);
        let target = Topology {
            pools: vec![standard.clone(), big.clone()],
            workloads: vec![nginx(), echo.clone()],
            ..Default::default()
        };
        let pools = vec![observed_pool(standard, 3), observed_pool(big, 3)];
        let placements = BTreeMap::from([
            placed(&nginx(), &[("ng-2xlarge", 3)]),
            placed(&echo, &[("ng-standard", 3)]),
        ]);

        assert!(plan_for(&target, &pools, &placements).is_empty());
    }

    #[test]
    fn new_workload_waits_for_tolerated_new_pools_only() {
        let target = Topology {
            pools: vec![
                NodePoolSpec::new("ng-standard", "t2.medium", 3),
                NodePoolSpec::new("ng-2xlarge", "t3.2xlarge", 3).with_taint(nginx_taint()),
            ],
            workloads: vec![WorkloadSpec::new("apps", "echoserver", 3)],
            ..Default::default()
        };
        let plan = plan_for(&target, &[], &BTreeMap::new());
        let place = plan
            .find(|s| matches!(s, MigrationStep::PlaceWorkload { .. }))
            .unwrap();
        let standard_ready = plan
            .position(&MigrationStep::AwaitPoolReady {
                pool: "ng-standard".into(),
            })
            .unwrap();
        assert_eq!(place.depends_on, vec![standard_ready]);
    }

    #[test]
    fn instance_class_change_is_rejected_not_replaced() {
        let observed = NodePoolSpec::new("ng-standard", "t2.medium", 3);
        let target = Topology {
            pools: vec![NodePoolSpec::new("ng-standard", "t3.large", 3)],
            ..Default::default()
        };
        let plan = plan_for(&target, &[observed_pool(observed, 0)], &BTreeMap::new());
        assert_eq!(
            kinds(&plan),
            vec![(
                MigrationStep::RejectPoolChange {
                    pool: "ng-standard".into(),
                    field: "instance_class".into(),
                },
                vec![]
            )]
        );
    }

    #[test]
    fn node_count_change_resizes_in_place() {
        let observed = NodePoolSpec::new("ng-standard", "t2.medium", 3);
        let target = Topology {
            pools: vec![NodePoolSpec::new("ng-standard", "t2.medium", 5)],
            ..Default::default()
        };
        let plan = plan_for(&target, &[observed_pool(observed, 0)], &BTreeMap::new());
        assert_eq!(
            kinds(&plan),
            vec![(
                MigrationStep::ResizePool {
                    pool: "ng-standard".into(),
                    from: 3,
                    to: 5,
                },
                vec![]
            )]
        );
    }

    #[test]
    fn migration_without_tolerated_destination_has_no_target() {
        let old = NodePoolSpec::new("ng-old", "t2.medium", 3);
        let echo = WorkloadSpec::new("apps", "echoserver", 2);
        let target = Topology {
            pools: vec![NodePoolSpec::new("ng-2xlarge", "t3.2xlarge", 3).with_taint(nginx_taint())],
            workloads: vec![echo.clone()],
            ..Default::default()
        };
        let plan = plan_for(
            &target,
            &[observed_pool(old, 2)],
            &BTreeMap::from([placed(&echo, &[("ng-old", 2)])]),
        );
        let migrate = plan
            .find(|s| matches!(s, MigrationStep::MigrateWorkload { .. }))
            .unwrap();
        assert!(matches!(
            &migrate.step,
            MigrationStep::MigrateWorkload { to_pool: None, .. }
        ));
        assert!(migrate.depends_on.is_empty());
        let drain = plan
            .position(&MigrationStep::DrainPool {
                pool: "ng-old".into(),
            })
            .unwrap();
        assert_eq!(plan.steps[drain].depends_on, vec![migrate.id]);
    }

    #[test]
    fn replica_change_scales_after_moves() {
        let standard = NodePoolSpec::new("ng-standard", "t2.medium", 3);
        let echo = WorkloadSpec::new("apps", "echoserver", 5);
        let target = Topology {
            pools: vec![standard.clone()],
            workloads: vec![echo.clone()],
            ..Default::default()
        };
        let plan = plan_for(
            &target,
            &[observed_pool(standard, 3)],
            &BTreeMap::from([placed(&echo, &[("ng-standard", 3)])]),
        );
        assert_eq!(
            kinds(&plan),
            vec![(
                MigrationStep::ScaleWorkload {
                    workload: echo.key(),
                    from: 3,
                    to: 5,
                },
                vec![]
            )]
        );
    }

    #[test]
    fn moves_off_two_leaving_pools_run_in_sequence() {
        let echo = WorkloadSpec::new("apps", "echoserver", 4);
        let target = Topology {
            pools: vec![NodePoolSpec::new("ng-new", "t3.large", 2)],
            workloads: vec![echo.clone()],
            ..Default::default()
        };
        let pools = vec![
            observed_pool(NodePoolSpec::new("ng-old-1", "t2.medium", 1), 2),
            observed_pool(NodePoolSpec::new("ng-old-2", "t2.medium", 1), 2),
        ];
        let placements = BTreeMap::from([placed(&echo, &[("ng-old-1", 2), ("ng-old-2", 2)])]);

        let plan = plan_for(&target, &pools, &placements);
        let ready = plan
            .position(&MigrationStep::AwaitPoolReady { pool: "ng-new".into() })
            .unwrap();
        let moves: Vec<&PlannedStep> = plan
            .steps
            .iter()
            .filter(|s| matches!(s.step, MigrationStep::MigrateWorkload { .. }))
            .collect();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].depends_on, vec![ready]);
        assert_eq!(moves[1].depends_on, vec![ready, moves[0].id]);

        let drain_2 = plan
            .find(|s| matches!(s, MigrationStep::DrainPool { pool } if pool == "ng-old-2"))
            .unwrap();
        assert_eq!(drain_2.depends_on, vec![moves[1].id]);
    }

    #[test]
    fn leftover_role_of_a_deleted_pool_is_revoked() {
        let target = Topology {
            pools: vec![NodePoolSpec::new("ng-standard", "t2.medium", 2)],
            ..Default::default()
        };
        let pools = vec![observed_pool(NodePoolSpec::new("ng-standard", "t2.medium", 2), 0)];
        let owners = BTreeSet::from(["ng-standard".to_string(), "ng-old".to_string()]);

        let plan = build_plan(&target, &pools, &BTreeMap::new(), &owners);
        assert_eq!(
            kinds(&plan),
            vec![(MigrationStep::RevokeIdentity { pool: "ng-old".into() }, vec![])]
        );
    }

    #[test]
    fn role_of_a_declared_pool_is_kept() {
        // The pool is gone but declared again; its role is adopted on create.
        let target = Topology {
            pools: vec![NodePoolSpec::new("ng-old", "t2.medium", 1)],
            ..Default::default()
        };
        let owners = BTreeSet::from(["ng-old".to_string()]);
        let plan = build_plan(&target, &[], &BTreeMap::new(), &owners);
        assert!(plan
            .find(|s| matches!(s, MigrationStep::RevokeIdentity { .. }))
            .is_none());
        assert!(plan
            .position(&MigrationStep::CreatePool { pool: "ng-old".into() })
            .is_some());
    }

    #[test]
    fn planning_is_deterministic() {
        let target = Topology {
            pools: vec![
                NodePoolSpec::new("ng-2", "t3.large", 1),
                NodePoolSpec::new("ng-1", "t3.large", 1),
            ],
            workloads: vec![
                WorkloadSpec::new("apps", "b", 1),
                WorkloadSpec::new("apps", "a", 1),
            ],
            ..Default::default()
        };
        let pools = vec![
            observed_pool(NodePoolSpec::new("ng-old-2", "t2.medium", 1), 0),
            observed_pool(NodePoolSpec::new("ng-old-1", "t2.medium", 1), 0),
        ];
        let a = plan_for(&target, &pools, &BTreeMap::new());
        let b = plan_for(&target, &pools, &BTreeMap::new());
        assert_eq!(a, b);
        let drains: Vec<&str> = a
            .steps
            .iter()
            .filter_map(|s| match &s.step {
                MigrationStep::DrainPool { pool } => Some(pool.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(drains, vec!["ng-old-1", "ng-old-2"]);
    }
}
