//! Orchestrates node-pool migrations: provisions per-pool identities,
//! creates and retires pools, and moves workloads between them without
//! dropping below their healthy replica count.

pub mod config;
pub mod http;
pub mod identity;
pub mod metrics;
pub mod placement;
pub mod planner;
pub mod pool;
pub mod reconcile;
pub mod retry;
pub mod trigger;

pub use config::OrchestratorConfig;
pub use identity::IdentityProvisioner;
pub use metrics::SharedMetrics;
pub use placement::{MigrationOutcome, PlacementCoordinator};
pub use planner::build_plan;
pub use pool::PoolManager;
pub use reconcile::Orchestrator;
pub use retry::{retry_transient, RetryConfig};
