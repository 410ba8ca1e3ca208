use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, FleetError};
use crate::plan::{MigrationStep, PlannedStep};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A step this one depends on failed or was itself skipped.
    DependencyFailed { step: usize },
    /// The reconciliation was cancelled before this step started.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
    Skipped {
        #[serde(flatten)]
        reason: SkipReason,
    },
}

impl StepOutcome {
    pub fn succeeded(detail: Option<String>) -> Self {
        Self::Succeeded { detail }
    }

    pub fn failed(err: &FleetError) -> Self {
        Self::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepReport {
    pub id: usize,
    pub step: MigrationStep,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    pub outcome: StepOutcome,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl StepReport {
    pub fn new(planned: &PlannedStep, outcome: StepOutcome, elapsed_ms: u64) -> Self {
        Self {
            id: planned.id,
            step: planned.step.clone(),
            depends_on: planned.depends_on.clone(),
            outcome,
            elapsed_ms,
        }
    }
}

/// Failure that stopped a run before any step could be planned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&FleetError> for RunError {
    fn from(err: &FleetError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Per-step outcome of one reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
    /// Set when the target was rejected or the fleet could not be observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub steps: Vec<StepReport>,
}

impl MigrationReport {
    /// Every step succeeded (an empty plan is converged).
    pub fn is_converged(&self) -> bool {
        self.error.is_none() && !self.cancelled && self.steps.iter().all(|s| s.outcome.is_success())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.outcome.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Skipped { .. }))
    }

    pub fn outcome_of(&self, step: &MigrationStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| &s.step == step).map(|s| &s.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadKey;

    fn planned(id: usize, step: MigrationStep) -> PlannedStep {
        PlannedStep {
            id,
            step,
            depends_on: vec![],
        }
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let skipped = StepOutcome::Skipped {
            reason: SkipReason::DependencyFailed { step: 2 },
        };
        let json = serde_json::to_value(&skipped).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "dependency_failed");
        assert_eq!(json["step"], 2);

        let failed = StepOutcome::failed(&FleetError::PoolNotFound("ng-1".into()));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["kind"], "pool_not_found");
    }

    #[test]
    fn convergence_requires_clean_run() {
        let now = Utc::now();
        let step = MigrationStep::PlaceWorkload {
            workload: WorkloadKey {
                namespace: "apps".into(),
                name: "echoserver".into(),
            },
        };
        let mut report = MigrationReport {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            cancelled: false,
            error: None,
            steps: vec![StepReport::new(&planned(0, step.clone()), StepOutcome::succeeded(None), 3)],
        };
        assert!(report.is_converged());
        assert!(report.outcome_of(&step).unwrap().is_success());

        report.error = Some(RunError::from(&FleetError::invalid_topology("dup")));
        assert!(!report.is_converged());
    }
}
