use std::collections::BTreeMap;

use fleet_common::util::now_ms;
use fleet_common::{
    MigrationPlan, MigrationReport, PlacementState, PoolState, SkipReason, StepOutcome,
};

fn age(observed_at_ms: u64) -> String {
    if observed_at_ms == 0 {
        return "-".to_string();
    }
    format!("{}ms ago", now_ms().saturating_sub(observed_at_ms))
}

fn per_pool(counts: &BTreeMap<String, u32>) -> String {
    if counts.is_empty() {
        return "-".to_string();
    }
    counts
        .iter()
        .map(|(pool, n)| format!("{pool}={n}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn print_pools(pools: &[PoolState]) {
    println!("\n=== Node Pools ===\n");
    if pools.is_empty() {
        println!("No pools observed.");
        return;
    }
    println!(
        "{:<20} {:<14} {:<12} {:<10} {:<10} {:<10} {:<28} {:<12}",
        "Name", "Class", "Phase", "Nodes", "Replicas", "Spare", "Role", "Observed"
    );
    println!("{:-<120}", "");
    for p in pools {
        println!(
            "{:<20} {:<14} {:<12} {:<10} {:<10} {:<10} {:<28} {:<12}",
            p.name,
            p.spec.instance_class,
            p.phase.to_string(),
            format!("{}/{}", p.healthy_nodes, p.spec.desired_nodes),
            p.resident_replicas,
            p.spare_capacity(),
            p.identity.role_name,
            age(p.observed_at_ms)
        );
        for t in &p.spec.taints {
            println!("  taint {}={}:{:?}", t.key, t.value, t.effect);
        }
    }
    println!();
}

pub fn print_placements(placements: &[PlacementState]) {
    println!("\n=== Placements ===\n");
    if placements.is_empty() {
        println!("No workloads observed.");
        return;
    }
    println!(
        "{:<35} {:<10} {:<30} {:<30} {:<8}",
        "Workload", "Desired", "Targets", "Healthy", "Ready"
    );
    println!("{:-<115}", "");
    for p in placements {
        println!(
            "{:<35} {:<10} {:<30} {:<30} {:<8}",
            p.workload.to_string(),
            p.desired_replicas,
            per_pool(&p.pools),
            per_pool(&p.healthy),
            if p.ready { "yes" } else { "no" }
        );
    }
    println!();
}

pub fn print_plan(plan: &MigrationPlan) {
    println!("\n=== Migration Plan ===\n");
    if plan.is_empty() {
        println!("Nothing to do: the fleet matches the target.");
        return;
    }
    println!("{:<5} {:<70} {:<15}", "ID", "Step", "After");
    println!("{:-<90}", "");
    for s in &plan.steps {
        let after = if s.depends_on.is_empty() {
            "-".to_string()
        } else {
            s.depends_on
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        println!("{:<5} {:<70} {:<15}", s.id, s.step.to_string(), after);
    }
    println!();
}

fn outcome_label(outcome: &StepOutcome) -> (String, String) {
    match outcome {
        StepOutcome::Succeeded { detail } => ("OK".into(), detail.clone().unwrap_or_default()),
        StepOutcome::Failed { kind, message } => ("FAILED".into(), format!("{kind:?}: {message}")),
        StepOutcome::Skipped { reason } => (
            "SKIPPED".into(),
            match reason {
                SkipReason::DependencyFailed { step } => format!("step {step} did not succeed"),
                SkipReason::Cancelled => "run cancelled".into(),
            },
        ),
    }
}

pub fn print_report(report: &MigrationReport) {
    println!("\n=== Migration Report {} ===\n", report.run_id);
    println!(
        "Started {}  Finished {}",
        report.started_at.format("%Y-%m-%d %H:%M:%S"),
        report.finished_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(err) = &report.error {
        println!("✗ Run aborted: {:?}: {}", err.kind, err.message);
        return;
    }
    if report.steps.is_empty() {
        println!("✓ Nothing to do.");
        return;
    }
    println!(
        "\n{:<5} {:<60} {:<8} {:<10} {}",
        "ID", "Step", "Status", "Elapsed", "Detail"
    );
    println!("{:-<120}", "");
    for s in &report.steps {
        let (status, detail) = outcome_label(&s.outcome);
        println!(
            "{:<5} {:<60} {:<8} {:<10} {}",
            s.id,
            s.step.to_string(),
            status,
            format!("{}ms", s.elapsed_ms),
            detail
        );
    }
    println!();
    if report.is_converged() {
        println!("✓ Converged ({} steps)", report.steps.len());
    } else {
        println!(
            "✗ Not converged: {} succeeded, {} failed, {} skipped{}",
            report.succeeded().count(),
            report.failed().count(),
            report.skipped().count(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
    }
}
