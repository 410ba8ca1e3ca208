use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use fleet_orchestrator::{OrchestratorConfig, RetryConfig};
use fleet_provider::SimConfig;

#[derive(Debug, Parser)]
#[command(name = "fleet-orchestrator", about = "Node-pool migration orchestrator")]
pub struct Args {
    #[arg(long, env = "FLEET_LISTEN_ADDR", default_value = "0.0.0.0:18090")]
    pub listen_addr: String,

    /// etcd endpoint for the meta store. Without it, state is kept in memory.
    #[arg(long, env = "FLEET_ETCD_ENDPOINT")]
    pub etcd_endpoint: Option<String>,

    /// Target topology (JSON) written to the store at startup.
    #[arg(long)]
    pub topology: Option<PathBuf>,

    /// Reconcile `--topology` once, print the report as JSON, and exit.
    #[arg(long, requires = "topology")]
    pub once: bool,

    #[arg(long, default_value_t = 60)]
    pub resync_interval_secs: u64,

    #[arg(long, default_value_t = 2_000)]
    pub poll_interval_ms: u64,

    #[arg(long, default_value_t = 900)]
    pub provision_timeout_secs: u64,

    #[arg(long, default_value_t = 300)]
    pub readiness_timeout_secs: u64,

    #[arg(long, default_value_t = 600)]
    pub drain_timeout_secs: u64,

    /// Replicas moved per migration batch.
    #[arg(long, default_value_t = 1)]
    pub max_surge: u32,

    /// Attempts per provider call, including the first.
    #[arg(long, default_value_t = 4)]
    pub retry_max_attempts: u32,

    /// Status polls a simulated pool spends being created.
    #[arg(long, default_value_t = 1)]
    pub sim_create_delay_polls: u32,

    #[arg(long, default_value_t = 1)]
    pub sim_nodes_per_poll: u32,

    #[arg(long, default_value_t = 1)]
    pub sim_replicas_per_poll: u32,

    /// OTLP/HTTP endpoint for trace export (e.g. "http://127.0.0.1:4318").
    #[arg(long, env = "FLEET_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "FLEET_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            provision_timeout: Duration::from_secs(self.provision_timeout_secs),
            readiness_timeout: Duration::from_secs(self.readiness_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_surge: self.max_surge.max(1),
            retry: RetryConfig::with_max_attempts(self.retry_max_attempts),
            ..Default::default()
        }
    }

    pub fn sim_config(&self) -> SimConfig {
        SimConfig {
            create_delay_polls: self.sim_create_delay_polls,
            nodes_per_poll: self.sim_nodes_per_poll,
            replicas_per_poll: self.sim_replicas_per_poll,
        }
    }
}
