//! Workload naming
//!
//! Maps (cluster, node group index, replica slot) to the stable name of the
//! workload serving that slot, e.g. `example-elasticsearch-clientdatamaster-0-1`.
//! The same slot always renders to the same name, so repeated passes find
//! the workloads earlier passes created.

use super::model::{ClusterKey, RoleSet};
use std::collections::BTreeMap;

// =============================================================================
// Labels
// =============================================================================

pub const LABEL_CLUSTER: &str = "cluster-name";
pub const LABEL_GROUP: &str = "node-group";
pub const LABEL_REPLICA: &str = "node-replica";
pub const LABEL_ROLES: &str = "node-roles";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on every workload we own
pub const MANAGED_BY: &str = "elasticsearch-operator";

/// Kubernetes limit on the length of a label value
pub const MAX_LABEL_VALUE_LEN: usize = 63;

// =============================================================================
// Workload Identity
// =============================================================================

/// Identity of the workload serving one replica slot of one node group.
///
/// Ordering follows (cluster, group, replica), which is the order intents
/// are emitted in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadIdentity {
    pub cluster: ClusterKey,
    pub group_index: u32,
    /// 1-based slot within the group
    pub replica_index: u32,
    pub roles: RoleSet,
}

/// Identity of slot `replica_index` (1-based) of group `group_index`.
///
/// `roles` is the role set of the group. It never changes after the group is
/// created, so for a given cluster the result depends on the indices only.
pub fn identify(
    cluster: &ClusterKey,
    group_index: usize,
    replica_index: u32,
    roles: RoleSet,
) -> WorkloadIdentity {
    debug_assert!(replica_index >= 1, "replica slots are 1-based");
    WorkloadIdentity {
        cluster: cluster.clone(),
        group_index: group_index as u32,
        replica_index,
        roles,
    }
}

impl WorkloadIdentity {
    /// Rendered workload name: `<cluster>-<roles>-<group>-<replica>`
    pub fn name(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.cluster.name, self.roles, self.group_index, self.replica_index
        )
    }

    /// Ordering key within a cluster
    #[inline]
    pub fn slot(&self) -> (u32, u32) {
        (self.group_index, self.replica_index)
    }

    /// Labels stamped on the workload so it can be found and identified again
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CLUSTER.to_string(), self.cluster.name.clone());
        labels.insert(LABEL_GROUP.to_string(), self.group_index.to_string());
        labels.insert(LABEL_REPLICA.to_string(), self.replica_index.to_string());
        labels.insert(LABEL_ROLES.to_string(), roles_label(&self.roles));
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        labels
    }

    /// Recover an identity from the labels of an observed workload.
    /// Returns None for objects we did not create.
    pub fn from_labels(namespace: &str, labels: &BTreeMap<String, String>) -> Option<Self> {
        if labels.get(LABEL_MANAGED_BY).map(String::as_str) != Some(MANAGED_BY) {
            return None;
        }
        let cluster = labels.get(LABEL_CLUSTER)?;
        let group_index = labels.get(LABEL_GROUP)?.parse().ok()?;
        let replica_index: u32 = labels.get(LABEL_REPLICA)?.parse().ok()?;
        if replica_index == 0 {
            return None;
        }
        let role_names: Vec<&str> = labels.get(LABEL_ROLES)?.split('.').collect();
        let roles = RoleSet::parse(&role_names).ok()?;

        Some(Self {
            cluster: ClusterKey::new(namespace, cluster.clone()),
            group_index,
            replica_index,
            roles,
        })
    }
}

impl std::fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Label selector matching every workload of a cluster
pub fn cluster_selector(cluster: &ClusterKey) -> String {
    format!(
        "{}={},{}={}",
        LABEL_CLUSTER, cluster.name, LABEL_MANAGED_BY, MANAGED_BY
    )
}

/// Label selector matching every workload this operator manages
pub fn managed_selector() -> String {
    format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY)
}

// Label values may not contain commas
fn roles_label(roles: &RoleSet) -> String {
    roles.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::model::NodeRole;
    use std::collections::HashSet;

    fn all_roles() -> RoleSet {
        RoleSet::from_roles(NodeRole::ALL)
    }

    #[test]
    fn test_name_follows_convention() {
        let key = ClusterKey::new("logging", "example-elasticsearch");
        let id = identify(&key, 0, 1, all_roles());
        assert_eq!(id.name(), "example-elasticsearch-clientdatamaster-0-1");

        let id = identify(&key, 1, 2, all_roles());
        assert_eq!(id.to_string(), "example-elasticsearch-clientdatamaster-1-2");
    }

    #[test]
    fn test_identify_is_deterministic() {
        let key = ClusterKey::new("default", "c");
        assert_eq!(
            identify(&key, 3, 7, all_roles()),
            identify(&key, 3, 7, all_roles())
        );
        assert_eq!(
            identify(&key, 3, 7, all_roles()).name(),
            identify(&key, 3, 7, all_roles()).name()
        );
    }

    #[test]
    fn test_names_are_injective() {
        // Multi-digit indices must not collide, e.g. (1, 11) vs (11, 1)
        let key = ClusterKey::new("default", "c");
        let mut seen = HashSet::new();
        for group in 0..15 {
            for replica in 1..15 {
                assert!(seen.insert(identify(&key, group, replica, all_roles()).name()));
            }
        }
    }

    #[test]
    fn test_groups_with_same_roles_are_distinct() {
        let key = ClusterKey::new("default", "c");
        let a = identify(&key, 0, 1, all_roles());
        let b = identify(&key, 1, 1, all_roles());
        assert_ne!(a, b);
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_labels_round_trip() {
        let key = ClusterKey::new("logging", "es");
        let id = identify(&key, 2, 3, RoleSet::from_roles([NodeRole::Data, NodeRole::Master]));
        let labels = id.labels();
        assert_eq!(labels.get(LABEL_ROLES).unwrap(), "data.master");
        assert_eq!(WorkloadIdentity::from_labels("logging", &labels), Some(id));
    }

    #[test]
    fn test_foreign_labels_are_ignored() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CLUSTER.to_string(), "es".to_string());
        labels.insert(LABEL_GROUP.to_string(), "0".to_string());
        labels.insert(LABEL_REPLICA.to_string(), "1".to_string());
        labels.insert(LABEL_ROLES.to_string(), "data".to_string());
        assert!(WorkloadIdentity::from_labels("default", &labels).is_none());

        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        labels.insert(LABEL_REPLICA.to_string(), "zero".to_string());
        assert!(WorkloadIdentity::from_labels("default", &labels).is_none());
    }

    #[test]
    fn test_ordering_is_group_then_replica() {
        let key = ClusterKey::new("default", "c");
        let mut ids = vec![
            identify(&key, 1, 1, all_roles()),
            identify(&key, 0, 2, all_roles()),
            identify(&key, 0, 1, all_roles()),
        ];
        ids.sort();
        let slots: Vec<_> = ids.iter().map(|i| i.slot()).collect();
        assert_eq!(slots, vec![(0, 1), (0, 2), (1, 1)]);
    }
}
