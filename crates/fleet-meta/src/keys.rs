//! Key layout of fleet records in the meta store.

pub const POOLS_PREFIX: &str = "/fleet/pools/";
pub const IDENTITIES_PREFIX: &str = "/fleet/identities/";
pub const WORKLOADS_PREFIX: &str = "/fleet/workloads/";
pub const TOPOLOGY_PREFIX: &str = "/fleet/topology/";
pub const TARGET_TOPOLOGY_KEY: &str = "/fleet/topology/target";
pub const LAST_REPORT_KEY: &str = "/fleet/reports/last";

pub fn pool_key(name: &str) -> String {
    format!("{POOLS_PREFIX}{name}")
}

pub fn identity_key(role_name: &str) -> String {
    format!("{IDENTITIES_PREFIX}{role_name}")
}

pub fn workload_key(namespace: &str, name: &str) -> String {
    format!("{WORKLOADS_PREFIX}{namespace}/{name}")
}
