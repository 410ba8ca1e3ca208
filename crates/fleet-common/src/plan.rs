use std::fmt;

use serde::{Deserialize, Serialize};

use crate::workload::WorkloadKey;

/// One unit of work in a migration plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationStep {
    ProvisionIdentity {
        pool: String,
    },
    CreatePool {
        pool: String,
    },
    AwaitPoolReady {
        pool: String,
    },
    ResizePool {
        pool: String,
        from: u32,
        to: u32,
    },
    /// An existing pool was redeclared with a different immutable field.
    RejectPoolChange {
        pool: String,
        field: String,
    },
    PlaceWorkload {
        workload: WorkloadKey,
    },
    ScaleWorkload {
        workload: WorkloadKey,
        from: u32,
        to: u32,
    },
    /// Move every replica of `workload` off `from_pool`. `to_pool` is None
    /// when no surviving pool tolerates the workload.
    MigrateWorkload {
        workload: WorkloadKey,
        from_pool: String,
        to_pool: Option<String>,
        replicas: u32,
    },
    DrainPool {
        pool: String,
    },
    DeletePool {
        pool: String,
    },
    RevokeIdentity {
        pool: String,
    },
}

impl MigrationStep {
    /// Pool this step operates on, if any.
    pub fn pool(&self) -> Option<&str> {
        match self {
            Self::ProvisionIdentity { pool }
            | Self::CreatePool { pool }
            | Self::AwaitPoolReady { pool }
            | Self::ResizePool { pool, .. }
            | Self::RejectPoolChange { pool, .. }
            | Self::DrainPool { pool }
            | Self::DeletePool { pool }
            | Self::RevokeIdentity { pool } => Some(pool),
            Self::PlaceWorkload { .. } | Self::ScaleWorkload { .. } => None,
            Self::MigrateWorkload { from_pool, .. } => Some(from_pool),
        }
    }

    pub fn workload(&self) -> Option<&WorkloadKey> {
        match self {
            Self::PlaceWorkload { workload }
            | Self::ScaleWorkload { workload, .. }
            | Self::MigrateWorkload { workload, .. } => Some(workload),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProvisionIdentity { pool } => write!(f, "provision identity for {pool}"),
            Self::CreatePool { pool } => write!(f, "create pool {pool}"),
            Self::AwaitPoolReady { pool } => write!(f, "wait for pool {pool} to be ready"),
            Self::ResizePool { pool, from, to } => write!(f, "resize pool {pool} {from}->{to} nodes"),
            Self::RejectPoolChange { pool, field } => {
                write!(f, "reject change of {field} on pool {pool}")
            }
            Self::PlaceWorkload { workload } => write!(f, "place {workload}"),
            Self::ScaleWorkload { workload, from, to } => {
                write!(f, "scale {workload} {from}->{to} replicas")
            }
            Self::MigrateWorkload {
                workload,
                from_pool,
                to_pool,
                replicas,
            } => write!(
                f,
                "migrate {replicas} replicas of {workload} from {from_pool} to {}",
                to_pool.as_deref().unwrap_or("<none>")
            ),
            Self::DrainPool { pool } => write!(f, "drain pool {pool}"),
            Self::DeletePool { pool } => write!(f, "delete pool {pool}"),
            Self::RevokeIdentity { pool } => write!(f, "revoke identity of {pool}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedStep {
    pub id: usize,
    #[serde(flatten)]
    pub step: MigrationStep,
    /// Ids of steps that must succeed before this one runs.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// Dependency-ordered steps converging the observed fleet to a target.
///
/// Steps are listed in a valid execution order: every dependency has a
/// smaller id than its dependent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationPlan {
    pub steps: Vec<PlannedStep>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn push(&mut self, step: MigrationStep, depends_on: Vec<usize>) -> usize {
        let id = self.steps.len();
        self.steps.push(PlannedStep {
            id,
            step,
            depends_on,
        });
        id
    }

    pub fn find(&self, pred: impl Fn(&MigrationStep) -> bool) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| pred(&s.step))
    }

    /// Position of the first step equal to `step`.
    pub fn position(&self, step: &MigrationStep) -> Option<usize> {
        self.steps.iter().position(|s| &s.step == step)
    }
}
