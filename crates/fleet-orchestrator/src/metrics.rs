use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;

use fleet_common::{MigrationReport, StepOutcome};

/// Shared metrics for the orchestrator, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    /// Reconciliations started.
    pub reconcile_total: AtomicU64,
    /// Reconciliations that did not converge.
    pub reconcile_failures: AtomicU64,
    pub steps_succeeded_total: AtomicU64,
    pub steps_failed_total: AtomicU64,
    pub steps_skipped_total: AtomicU64,
    /// Workload migrations completed.
    pub migrations_total: AtomicU64,
    /// Pools currently Ready (gauge).
    pub pools_ready: AtomicU64,
    /// Wall time of the last reconciliation.
    pub last_reconcile_ms: AtomicU64,
}

impl SharedMetrics {
    pub fn record_report(&self, report: &MigrationReport) {
        if !report.is_converged() {
            self.reconcile_failures.fetch_add(1, Ordering::Relaxed);
        }
        for step in &report.steps {
            let counter = match step.outcome {
                StepOutcome::Succeeded { .. } => &self.steps_succeeded_total,
                StepOutcome::Failed { .. } => &self.steps_failed_total,
                StepOutcome::Skipped { .. } => &self.steps_skipped_total,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        let elapsed = (report.finished_at - report.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.last_reconcile_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        format!(
            "# HELP fleet_reconcile_total Reconciliations started.\n\
             # TYPE fleet_reconcile_total counter\n\
             fleet_reconcile_total {}\n\
             # HELP fleet_reconcile_failures_total Reconciliations that did not converge.\n\
             # TYPE fleet_reconcile_failures_total counter\n\
             fleet_reconcile_failures_total {}\n\
             # HELP fleet_steps_total Migration steps by outcome.\n\
             # TYPE fleet_steps_total counter\n\
             fleet_steps_total{{outcome=\"succeeded\"}} {}\n\
             fleet_steps_total{{outcome=\"failed\"}} {}\n\
             fleet_steps_total{{outcome=\"skipped\"}} {}\n\
             # HELP fleet_migrations_total Workload migrations completed.\n\
             # TYPE fleet_migrations_total counter\n\
             fleet_migrations_total {}\n\
             # HELP fleet_pools_ready Node pools currently ready.\n\
             # TYPE fleet_pools_ready gauge\n\
             fleet_pools_ready {}\n\
             # HELP fleet_last_reconcile_ms Duration of the last reconciliation.\n\
             # TYPE fleet_last_reconcile_ms gauge\n\
             fleet_last_reconcile_ms {}\n",
            self.reconcile_total.load(Ordering::Relaxed),
            self.reconcile_failures.load(Ordering::Relaxed),
            self.steps_succeeded_total.load(Ordering::Relaxed),
            self.steps_failed_total.load(Ordering::Relaxed),
            self.steps_skipped_total.load(Ordering::Relaxed),
            self.migrations_total.load(Ordering::Relaxed),
            self.pools_ready.load(Ordering::Relaxed),
            self.last_reconcile_ms.load(Ordering::Relaxed),
        )
    }
}

/// GET /metrics
pub async fn metrics_handler(State(metrics): State<Arc<SharedMetrics>>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, metrics.render())
}

/// GET /healthz
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_step_outcomes() {
        let m = SharedMetrics::default();
        m.reconcile_total.fetch_add(2, Ordering::Relaxed);
        m.steps_failed_total.fetch_add(1, Ordering::Relaxed);
        let text = m.render();
        assert!(text.contains("fleet_reconcile_total 2\n"));
        assert!(text.contains("fleet_steps_total{outcome=\"failed\"} 1\n"));
        assert!(text.contains("# TYPE fleet_pools_ready gauge"));
    }
}
