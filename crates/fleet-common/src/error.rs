//! Error type shared by every fleet component.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while provisioning identities, managing pools, or placing workloads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FleetError {
    /// A pool's taint set is malformed or repeats a key.
    #[error("invalid taint set: {0}")]
    InvalidTaintSet(String),

    /// The identity is still bound to a live pool.
    #[error("identity {role_name} is still in use by pool {pool}")]
    IdentityInUse { role_name: String, pool: String },

    /// Delete was requested before the pool finished draining.
    #[error("pool {pool} is not drained (phase={phase}, resident_replicas={resident})")]
    PoolNotDrained {
        pool: String,
        phase: String,
        resident: u32,
    },

    /// No Ready, tolerated pool has room for the workload.
    #[error("workload {workload} is unschedulable: {reason}")]
    Unschedulable { workload: String, reason: String },

    #[error("pool {pool} did not become ready within {timeout:?}")]
    ProvisionTimeout { pool: String, timeout: Duration },

    #[error("workload {workload} did not become ready within {timeout:?}")]
    ReadinessTimeout { workload: String, timeout: Duration },

    #[error("pool {pool} still had resident replicas after {timeout:?}")]
    DrainTimeout { pool: String, timeout: Duration },

    /// Transient infrastructure failure; the only retryable kind.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("pool {0} not found")]
    PoolNotFound(String),

    /// Instance class or taints of an existing pool cannot change in place.
    #[error("pool {pool} already exists with a different {field}; create a pool with a new name instead")]
    ImmutablePoolSpec { pool: String, field: String },

    #[error("invalid topology: {0}")]
    InvalidTopology(String),
}

/// Serializable discriminant of [`FleetError`], used in migration reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidTaintSet,
    IdentityInUse,
    PoolNotDrained,
    Unschedulable,
    ProvisionTimeout,
    ReadinessTimeout,
    DrainTimeout,
    ProviderUnavailable,
    PoolNotFound,
    ImmutablePoolSpec,
    InvalidTopology,
}

impl FleetError {
    pub fn invalid_taints(msg: impl Into<String>) -> Self {
        Self::InvalidTaintSet(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable(msg.into())
    }

    pub fn unschedulable(workload: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unschedulable {
            workload: workload.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_topology(msg: impl Into<String>) -> Self {
        Self::InvalidTopology(msg.into())
    }

    /// Transient errors are retried with backoff; everything else is a
    /// caller or topology defect and is surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTaintSet(_) => ErrorKind::InvalidTaintSet,
            Self::IdentityInUse { .. } => ErrorKind::IdentityInUse,
            Self::PoolNotDrained { .. } => ErrorKind::PoolNotDrained,
            Self::Unschedulable { .. } => ErrorKind::Unschedulable,
            Self::ProvisionTimeout { .. } => ErrorKind::ProvisionTimeout,
            Self::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            Self::DrainTimeout { .. } => ErrorKind::DrainTimeout,
            Self::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            Self::PoolNotFound(_) => ErrorKind::PoolNotFound,
            Self::ImmutablePoolSpec { .. } => ErrorKind::ImmutablePoolSpec,
            Self::InvalidTopology(_) => ErrorKind::InvalidTopology,
        }
    }
}

impl From<anyhow::Error> for FleetError {
    /// Store and transport failures reach the components as transient provider errors.
    fn from(err: anyhow::Error) -> Self {
        Self::ProviderUnavailable(format!("{err:#}"))
    }
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_provider_errors_are_transient() {
        assert!(FleetError::unavailable("throttled").is_transient());
        assert!(!FleetError::invalid_taints("dup").is_transient());
        assert!(!FleetError::PoolNotDrained {
            pool: "ng-old".into(),
            phase: "ready".into(),
            resident: 3,
        }
        .is_transient());
        assert!(!FleetError::ProvisionTimeout {
            pool: "ng-2xlarge".into(),
            timeout: Duration::from_secs(1),
        }
        .is_transient());
    }

    #[test]
    fn kind_round_trips_through_json() {
        let err = FleetError::unschedulable("nginx-ingress", "no ready pool tolerated");
        let kind = err.kind();
        assert_eq!(kind, ErrorKind::Unschedulable);
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, "\"unschedulable\"");
    }

    #[test]
    fn messages_name_the_resource() {
        let err = FleetError::IdentityInUse {
            role_name: "ng-old-node-role".into(),
            pool: "ng-old".into(),
        };
        assert!(err.to_string().contains("ng-old-node-role"));
        assert!(err.to_string().contains("ng-old"));
    }

    #[test]
    fn anyhow_errors_become_transient() {
        let err: FleetError = anyhow::anyhow!("etcd connection reset").into();
        assert!(err.is_transient());
        assert!(err.to_string().contains("etcd connection reset"));
    }
}
