use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "fleetctl")]
#[command(about = "Fleet CLI for node-pool migrations", long_about = None)]
pub struct Args {
    /// Orchestrator URL
    #[arg(
        long,
        env = "FLEET_SERVER_URL",
        default_value = "http://127.0.0.1:18090"
    )]
    pub server_url: String,

    /// Print raw JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store a target topology; the orchestrator reconciles it in the background
    Apply {
        /// Topology file (JSON)
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Show the stored target topology
    Target,
    /// Show the steps needed to reach a topology, without running them
    Plan {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Reconcile toward a topology now and print the report
    Reconcile {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// List observed node pools
    Pools,
    /// List observed workload placements
    Placements,
    /// Show the last migration report
    Report,
    /// Fetch orchestrator metrics
    Metrics,
}
