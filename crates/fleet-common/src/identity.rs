use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque reference to a provisioned node identity (role plus instance profile).
///
/// Owned by the identity provisioner; bound to at most one live pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityHandle {
    /// Provider-assigned identifier.
    pub id: String,
    pub role_name: String,
}

/// Role name derived from the owning pool, so a lost handle can be found again.
pub fn role_name_for(pool: &str) -> String {
    format!("{pool}{ROLE_SUFFIX}")
}

const ROLE_SUFFIX: &str = "-node-role";

/// Pool a node role was derived from; None for roles this fleet did not name.
pub fn pool_for_role(role_name: &str) -> Option<&str> {
    role_name
        .strip_suffix(ROLE_SUFFIX)
        .filter(|pool| !pool.is_empty())
}

/// Least-privilege permissions attached to a node role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyTemplate {
    /// Managed policies attached to the role.
    pub managed_policies: Vec<String>,

    /// Principal allowed to assume the role.
    #[serde(default = "default_trusted_service")]
    pub trusted_service: String,

    /// Resource tags applied to the role and its instance profile.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_trusted_service() -> String {
    "ec2.amazonaws.com".to_string()
}

impl Default for PolicyTemplate {
    /// Join the cluster, run the pod network, pull images. Nothing else.
    fn default() -> Self {
        Self {
            managed_policies: vec![
                "AmazonEKSWorkerNodePolicy".to_string(),
                "AmazonEKS_CNI_Policy".to_string(),
                "AmazonEC2ContainerRegistryReadOnly".to_string(),
            ],
            trusted_service: default_trusted_service(),
            tags: BTreeMap::new(),
        }
    }
}

impl PolicyTemplate {
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags.extend(tags);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_map_back_to_pools() {
        assert_eq!(pool_for_role(&role_name_for("ng-old")), Some("ng-old"));
        assert_eq!(pool_for_role("ci-runner"), None);
        assert_eq!(pool_for_role("-node-role"), None);
    }
}
