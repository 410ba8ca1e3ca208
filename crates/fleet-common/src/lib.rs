pub mod error;
pub mod identity;
pub mod placement;
pub mod plan;
pub mod pool;
pub mod report;
pub mod taint;
pub mod topology;
pub mod util;
pub mod workload;

pub use error::{ErrorKind, FleetError, Result};
pub use identity::{pool_for_role, role_name_for, IdentityHandle, PolicyTemplate};
pub use placement::{PlacementState, ReplicaHealth};
pub use plan::{MigrationPlan, MigrationStep, PlannedStep};
pub use pool::{NodePoolSpec, PoolHandle, PoolPhase, PoolState, PoolStatus, ProviderPhase};
pub use report::{MigrationReport, RunError, SkipReason, StepOutcome, StepReport};
pub use taint::{tolerates_all, validate_taints, Taint, TaintEffect, Toleration, TolerationOperator};
pub use topology::Topology;
pub use workload::{WorkloadKey, WorkloadSpec};

pub mod telemetry;
