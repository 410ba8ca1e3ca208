use std::fmt;

use serde::{Deserialize, Serialize};

use crate::taint::{tolerates_all, Taint, Toleration};

/// Desired state of one workload, as declared in the target topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    pub replicas: u32,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Instance classes this workload should land on when possible,
    /// e.g. pinning an ingress controller to "t3.2xlarge".
    #[serde(default)]
    pub preferred_instance_classes: Vec<String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl WorkloadSpec {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, replicas: u32) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            replicas,
            tolerations: Vec::new(),
            preferred_instance_classes: Vec::new(),
        }
    }

    pub fn with_toleration(mut self, toleration: Toleration) -> Self {
        self.tolerations.push(toleration);
        self
    }

    pub fn prefer_instance_class(mut self, class: impl Into<String>) -> Self {
        self.preferred_instance_classes.push(class.into());
        self
    }

    pub fn key(&self) -> WorkloadKey {
        WorkloadKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn tolerates(&self, taints: &[Taint]) -> bool {
        tolerates_all(&self.tolerations, taints)
    }

    pub fn prefers(&self, instance_class: &str) -> bool {
        self.preferred_instance_classes
            .iter()
            .any(|c| c == instance_class)
    }
}

/// `namespace/name` identity of a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
