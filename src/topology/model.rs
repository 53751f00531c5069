//! Topology Model
//!
//! Typed, validated view of an `Elasticsearch` resource: an ordered list of
//! node groups, each with a role set, a replica count and a storage source.

use crate::crd::{Elasticsearch, ElasticsearchNode, ElasticsearchNodeSpec, ElasticsearchSpec};
use super::naming::MAX_LABEL_VALUE_LEN;
use crate::error::{Error, Result};
use kube::Resource;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

// =============================================================================
// Roles
// =============================================================================

/// Role of an Elasticsearch node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeRole {
    Client,
    Data,
    Master,
}

impl NodeRole {
    /// All roles in canonical order
    pub const ALL: [NodeRole; 3] = [NodeRole::Client, NodeRole::Data, NodeRole::Master];

    #[inline]
    fn bit(self) -> u8 {
        match self {
            NodeRole::Client => 0b001,
            NodeRole::Data => 0b010,
            NodeRole::Master => 0b100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Client => "client",
            NodeRole::Data => "data",
            NodeRole::Master => "master",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "client" => Ok(NodeRole::Client),
            "data" => Ok(NodeRole::Data),
            "master" => Ok(NodeRole::Master),
            other => Err(format!("unrecognized role '{}'", other)),
        }
    }
}

/// Set of roles carried by a node group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoleSet(u8);

impl RoleSet {
    /// Empty role set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build a role set from roles; duplicates collapse
    pub fn from_roles(roles: impl IntoIterator<Item = NodeRole>) -> Self {
        let mut set = Self::empty();
        for role in roles {
            set.insert(role);
        }
        set
    }

    /// Parse role names, rejecting unknown ones
    pub fn parse<S: AsRef<str>>(names: &[S]) -> std::result::Result<Self, String> {
        let mut set = Self::empty();
        for name in names {
            set.insert(name.as_ref().parse()?);
        }
        Ok(set)
    }

    pub fn insert(&mut self, role: NodeRole) {
        self.0 |= role.bit();
    }

    #[inline]
    pub fn contains(&self, role: NodeRole) -> bool {
        self.0 & role.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether nodes with these roles take part in master election
    #[inline]
    pub fn is_master_eligible(&self) -> bool {
        self.contains(NodeRole::Master)
    }

    /// Roles in canonical order
    pub fn iter(&self) -> impl Iterator<Item = NodeRole> + '_ {
        NodeRole::ALL.into_iter().filter(|r| self.contains(*r))
    }

    /// Comma separated role names, as handed to the node environment
    pub fn to_csv(&self) -> String {
        self.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(",")
    }
}

/// Concatenated role names in canonical order, e.g. "clientdatamaster"
impl std::fmt::Display for RoleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for role in self.iter() {
            f.write_str(role.as_str())?;
        }
        Ok(())
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Where a node keeps its data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageSource {
    /// Node-local scratch space, lost with the workload
    Ephemeral {
        medium: Option<String>,
        size_limit: Option<String>,
    },
    /// A claim per workload, named after it
    PersistentVolumeClaim {
        storage_class_name: Option<String>,
        size: String,
    },
}

impl Default for StorageSource {
    fn default() -> Self {
        StorageSource::Ephemeral {
            medium: None,
            size_limit: None,
        }
    }
}

impl StorageSource {
    pub fn is_persistent(&self) -> bool {
        matches!(self, StorageSource::PersistentVolumeClaim { .. })
    }
}

// =============================================================================
// Node Group
// =============================================================================

/// Largest replica count a single node group may ask for
pub const MAX_GROUP_REPLICAS: i32 = 1000;

/// One node group of the desired topology
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeGroup {
    pub roles: RoleSet,
    pub replicas: u32,
    pub storage: StorageSource,
    pub node_spec: ElasticsearchNodeSpec,
}

impl NodeGroup {
    /// Group with ephemeral storage and default node settings
    pub fn new(roles: RoleSet, replicas: u32) -> Self {
        Self {
            roles,
            replicas,
            storage: StorageSource::default(),
            node_spec: ElasticsearchNodeSpec::default(),
        }
    }

    pub fn with_storage(mut self, storage: StorageSource) -> Self {
        self.storage = storage;
        self
    }

    /// Validate and convert one node group of the resource
    fn from_node(
        index: usize,
        node: &ElasticsearchNode,
        shared: &ElasticsearchNodeSpec,
    ) -> Result<Self> {
        if node.roles.is_empty() {
            return Err(Error::InvalidRoleSet {
                group: index,
                reason: "role set is empty".into(),
            });
        }
        let roles = RoleSet::parse(&node.roles).map_err(|reason| Error::InvalidRoleSet {
            group: index,
            reason,
        })?;

        if !(0..=MAX_GROUP_REPLICAS).contains(&node.replicas) {
            return Err(Error::InvalidReplicas {
                group: index,
                replicas: node.replicas as i64,
            });
        }

        let storage = match (&node.storage.empty_dir, &node.storage.volume_claim_template) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidStorage {
                    group: index,
                    reason: "emptyDir and volumeClaimTemplate are mutually exclusive".into(),
                })
            }
            (_, Some(claim)) => {
                if claim.size.trim().is_empty() {
                    return Err(Error::InvalidStorage {
                        group: index,
                        reason: "volumeClaimTemplate.size is required".into(),
                    });
                }
                StorageSource::PersistentVolumeClaim {
                    storage_class_name: claim.storage_class_name.clone(),
                    size: claim.size.clone(),
                }
            }
            (Some(dir), None) => StorageSource::Ephemeral {
                medium: dir.medium.clone(),
                size_limit: dir.size_limit.clone(),
            },
            (None, None) => StorageSource::default(),
        };

        Ok(Self {
            roles,
            replicas: node.replicas as u32,
            storage,
            node_spec: merge_node_spec(shared, node.node_spec.as_ref()),
        })
    }
}

/// Per-group settings win over the shared ones, field by field
fn merge_node_spec(
    shared: &ElasticsearchNodeSpec,
    group: Option<&ElasticsearchNodeSpec>,
) -> ElasticsearchNodeSpec {
    match group {
        None => shared.clone(),
        Some(g) => ElasticsearchNodeSpec {
            image: g.image.clone().or_else(|| shared.image.clone()),
            cpu: g.cpu.clone().or_else(|| shared.cpu.clone()),
            memory: g.memory.clone().or_else(|| shared.memory.clone()),
        },
    }
}

// =============================================================================
// Cluster Key
// =============================================================================

/// Namespaced name of a managed cluster
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Owner of the workloads, used for garbage collection on the substrate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

// =============================================================================
// Cluster Spec
// =============================================================================

/// Desired state of one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub key: ClusterKey,
    /// Node groups; the position of a group is its index in workload names
    pub groups: Vec<NodeGroup>,
    pub secret_name: String,
    pub owner: Option<OwnerRef>,
    pub generation: Option<i64>,
}

impl ClusterSpec {
    /// Cluster without node groups
    pub fn new(key: ClusterKey) -> Self {
        Self {
            key,
            groups: Vec::new(),
            secret_name: String::new(),
            owner: None,
            generation: None,
        }
    }

    pub fn with_group(mut self, group: NodeGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Validate a resource spec under the given key
    pub fn from_parts(key: ClusterKey, spec: &ElasticsearchSpec) -> Result<Self> {
        if key.name.trim().is_empty() {
            return Err(Error::InvalidSpec("cluster name is empty".into()));
        }
        // The name is stamped on every workload as a label value
        if key.name.len() > MAX_LABEL_VALUE_LEN {
            return Err(Error::InvalidSpec(format!(
                "cluster name '{}' is longer than {} characters",
                key.name, MAX_LABEL_VALUE_LEN
            )));
        }

        let groups = spec
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| NodeGroup::from_node(index, node, &spec.node_spec))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            key,
            groups,
            secret_name: spec.secret_name.clone(),
            owner: None,
            generation: None,
        })
    }

    /// Validate an `Elasticsearch` resource as observed from the API server
    pub fn from_resource(resource: &Elasticsearch) -> Result<Self> {
        let name = resource
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::InvalidSpec("resource has no name".into()))?;
        let key = ClusterKey::new(resource.namespace_or_default(), name.clone());

        let mut spec = Self::from_parts(key, &resource.spec)?;
        spec.generation = resource.metadata.generation;
        spec.owner = resource.metadata.uid.clone().map(|uid| OwnerRef {
            api_version: Elasticsearch::api_version(&()).to_string(),
            kind: Elasticsearch::kind(&()).to_string(),
            name,
            uid,
        });
        Ok(spec)
    }

    /// Load an `Elasticsearch` manifest from a YAML file
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let resource: Elasticsearch = serde_yaml::from_str(&contents)?;
        Self::from_resource(&resource)
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Number of workloads this spec asks for
    pub fn desired_workload_count(&self) -> u32 {
        self.groups
            .iter()
            .fold(0u32, |total, g| total.saturating_add(g.replicas))
    }

    /// Stable hash over everything that shapes the workloads
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.key.hash(&mut hasher);
        self.groups.hash(&mut hasher);
        self.secret_name.hash(&mut hasher);
        hasher.finish()
    }
}
