mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fleet_common::telemetry::{init_tracing, TelemetryConfig};
use fleet_common::Topology;
use fleet_meta::{keys, EtcdMetaStore, MemoryMetaStore, MetaStore, MetaStoreExt};
use fleet_orchestrator::http::{router, AppState};
use fleet_orchestrator::trigger::{reconcile_and_record, resync_loop, watch_loop};
use fleet_orchestrator::Orchestrator;
use fleet_provider::SimFleet;

use crate::args::Args;

fn read_topology(path: &std::path::Path) -> Result<Topology> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read topology file {}", path.display()))?;
    let topology: Topology = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse topology file {}", path.display()))?;
    topology.validate()?;
    Ok(topology)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let otel = init_tracing(&TelemetryConfig {
        service_name: "fleet-orchestrator",
        otlp_endpoint: args.otlp_endpoint.as_deref(),
        otlp_token: args.otlp_token.as_deref(),
        default_filter: "info",
    });
    info!("fleet-orchestrator starting...");

    let store: Arc<dyn MetaStore> = match &args.etcd_endpoint {
        Some(endpoint) => {
            let store = EtcdMetaStore::connect(std::slice::from_ref(endpoint)).await?;
            info!("connected to etcd at {}", endpoint);
            Arc::new(store)
        }
        None => {
            info!("no etcd endpoint given, using in-memory store");
            Arc::new(MemoryMetaStore::new())
        }
    };

    let sim = SimFleet::new(store.clone(), args.sim_config());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(sim.clone()),
        Arc::new(sim.clone()),
        Arc::new(sim),
        args.orchestrator_config(),
    ));

    let initial = args.topology.as_deref().map(read_topology).transpose()?;

    let cancel = CancellationToken::new();

    if args.once {
        let Some(target) = initial else {
            anyhow::bail!("--once needs --topology");
        };
        let report = reconcile_and_record(&orchestrator, store.as_ref(), &target, &cancel).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if let Some(provider) = otel {
            let _ = provider.shutdown();
        }
        if !report.is_converged() {
            std::process::exit(1);
        }
        return Ok(());
    }

    if let Some(target) = &initial {
        let rev = store.put_json(keys::TARGET_TOPOLOGY_KEY, target).await?;
        info!(revision = rev, "initial target topology stored");
    }

    let watch = tokio::spawn(watch_loop(orchestrator.clone(), store.clone(), cancel.clone()));
    let resync = tokio::spawn(resync_loop(
        orchestrator.clone(),
        store.clone(),
        Duration::from_secs(args.resync_interval_secs.max(1)),
        cancel.clone(),
    ));

    let state = AppState {
        metrics: orchestrator.metrics(),
        orchestrator,
        store,
        cancel: cancel.clone(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!("listening on {}", args.listen_addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested, finishing in-flight steps");
            shutdown.cancel();
        })
        .await?;

    let _ = watch.await;
    let _ = resync.await;
    if let Some(provider) = otel {
        let _ = provider.shutdown();
    }
    Ok(())
}
