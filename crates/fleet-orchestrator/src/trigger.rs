//! Reconcile triggers driven by the meta store: a watch on the target
//! topology key, plus a periodic resync that re-applies the stored target.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleet_common::{MigrationReport, Topology};
use fleet_meta::{keys, MetaStore, MetaStoreExt};

use crate::reconcile::Orchestrator;

/// Reconcile toward `target` and persist the report.
pub async fn reconcile_and_record(
    orchestrator: &Orchestrator,
    store: &dyn MetaStore,
    target: &Topology,
    cancel: &CancellationToken,
) -> MigrationReport {
    let report = orchestrator.reconcile_until(target, cancel).await;
    if let Err(e) = store.put_json(keys::LAST_REPORT_KEY, &report).await {
        warn!(error=%e, "failed to store migration report");
    }
    report
}

async fn load_target(store: &dyn MetaStore) -> anyhow::Result<Option<(Topology, u64)>> {
    store.get_json::<Topology>(keys::TARGET_TOPOLOGY_KEY).await
}

/// Reconcile whenever the stored target changes. Reconnects when the watch
/// stream ends; returns once `cancel` fires.
pub async fn watch_loop(orchestrator: Arc<Orchestrator>, store: Arc<dyn MetaStore>, cancel: CancellationToken) {
    let mut last_revision: Option<u64> = None;

    // Whatever is already stored counts as the first change.
    match load_target(store.as_ref()).await {
        Ok(Some((target, rev))) => {
            info!(revision = rev, "reconciling stored target");
            reconcile_and_record(&orchestrator, store.as_ref(), &target, &cancel).await;
            last_revision = Some(rev);
        }
        Ok(None) => info!("no target topology stored yet"),
        Err(e) => warn!(error=%e, "failed to load target topology"),
    }

    while !cancel.is_cancelled() {
        info!("watching prefix: {}", keys::TOPOLOGY_PREFIX);
        let mut stream = match store.watch_prefix(keys::TOPOLOGY_PREFIX, last_revision).await {
            Ok(s) => s,
            Err(e) => {
                error!("failed to watch prefix: {}, retrying in 5s", e);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };
            if event.key != keys::TARGET_TOPOLOGY_KEY {
                continue;
            }
            last_revision = Some(event.revision);
            let Some(value) = event.value else {
                info!("target topology deleted, nothing to reconcile");
                continue;
            };
            let target: Topology = match serde_json::from_slice(&value) {
                Ok(t) => t,
                Err(e) => {
                    warn!("failed to deserialize target topology: {}", e);
                    continue;
                }
            };
            info!(revision = event.revision, "target topology changed");
            reconcile_and_record(&orchestrator, store.as_ref(), &target, &cancel).await;
        }

        warn!("watch stream ended, reconnecting...");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Re-apply the stored target every `interval`, catching drift the watch
/// cannot see (provider-side changes, failed steps worth retrying).
pub async fn resync_loop(
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn MetaStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("resync loop started (interval={}s)", interval.as_secs());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match load_target(store.as_ref()).await {
            Ok(Some((target, _))) => {
                let report = reconcile_and_record(&orchestrator, store.as_ref(), &target, &cancel).await;
                debug!(steps = report.steps.len(), converged = report.is_converged(), "resync done");
            }
            Ok(None) => debug!("resync skipped, no target stored"),
            Err(e) => {
                orchestrator
                    .metrics()
                    .reconcile_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(error=%e, "resync cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::NodePoolSpec;
    use fleet_meta::MemoryMetaStore;
    use fleet_provider::{SimConfig, SimFleet};

    use crate::config::OrchestratorConfig;

    #[tokio::test]
    async fn stored_target_change_triggers_reconcile() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let sim = SimFleet::new(store.clone(), SimConfig::default());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            OrchestratorConfig::fast(),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_loop(orchestrator.clone(), store.clone(), cancel.clone()));

        // Let the watch subscribe before writing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let target = Topology {
            pools: vec![NodePoolSpec::new("ng-standard", "t2.medium", 2)],
            ..Default::default()
        };
        store.put_json(keys::TARGET_TOPOLOGY_KEY, &target).await.unwrap();

        let mut report = None;
        for _ in 0..500 {
            if let Some((r, _)) = store
                .get_json::<MigrationReport>(keys::LAST_REPORT_KEY)
                .await
                .unwrap()
            {
                report = Some(r);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let report = report.expect("reconcile report stored");
        assert!(report.is_converged());
        assert_eq!(report.steps.len(), 3);
        assert_eq!(sim.identity_count().await.unwrap(), 1);
    }
}
