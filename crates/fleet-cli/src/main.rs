mod args;
mod client;
mod output;

use anyhow::Result;
use clap::Parser;
use reqwest::Client;

use fleet_common::{MigrationPlan, MigrationReport, PlacementState, PoolState, Topology};

use crate::args::{Args, Command};
use crate::client::{get_json, read_topology, send_topology, url};
use crate::output::{print_placements, print_plan, print_pools, print_report};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::new();
    let base = args.server_url.as_str();

    match args.command {
        Command::Apply { file } => {
            let topology = read_topology(&file)?;
            let resp: serde_json::Value =
                send_topology(client.put(url(base, "/v1/topology")), &topology).await?;
            println!(
                "✓ Target stored (revision {}): {} pools, {} workloads",
                resp["revision"], topology.pools.len(), topology.workloads.len()
            );
        }
        Command::Target => {
            let topology: Topology = get_json(&client, &url(base, "/v1/topology")).await?;
            println!("{}", serde_json::to_string_pretty(&topology)?);
        }
        Command::Plan { file } => {
            let topology = read_topology(&file)?;
            let plan: MigrationPlan =
                send_topology(client.post(url(base, "/v1/plan")), &topology).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_plan(&plan);
            }
        }
        Command::Reconcile { file } => {
            let topology = read_topology(&file)?;
            // The report comes back even when the run was aborted.
            let resp = client
                .post(url(base, "/v1/reconcile"))
                .json(&topology)
                .send()
                .await?;
            let report: MigrationReport = resp.json().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if !report.is_converged() {
                std::process::exit(1);
            }
        }
        Command::Pools => {
            let pools: Vec<PoolState> = get_json(&client, &url(base, "/v1/pools")).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&pools)?);
            } else {
                print_pools(&pools);
            }
        }
        Command::Placements => {
            let placements: Vec<PlacementState> =
                get_json(&client, &url(base, "/v1/placements")).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&placements)?);
            } else {
                print_placements(&placements);
            }
        }
        Command::Report => {
            let resp = client.get(url(base, "/v1/reports/last")).send().await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                println!("No reconciliation has run yet.");
                return Ok(());
            }
            let report: MigrationReport = resp.error_for_status()?.json().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Command::Metrics => {
            let resp = client.get(url(base, "/metrics")).send().await?;
            println!("{}", resp.text().await?);
        }
    }

    Ok(())
}
