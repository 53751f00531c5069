//! Domain Ports - Core trait definitions for the Elasticsearch operator
//!
//! These traits define the boundary between reconciliation logic and the
//! orchestration substrate that actually runs workloads. Adapters implement
//! them to provide concrete functionality.

use crate::crd::ElasticsearchNodeSpec;
use crate::error::Result;
use crate::topology::{ClusterKey, ClusterSpec, NodeGroup, OwnerRef, RoleSet, StorageSource, WorkloadIdentity};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Every workload serves exactly one Elasticsearch node
pub const REPLICAS_PER_WORKLOAD: i32 = 1;

// =============================================================================
// Workload Template
// =============================================================================

/// Everything the substrate needs to create one workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadTemplate {
    /// Roles of the node
    pub roles: RoleSet,
    /// Data storage source
    pub storage: StorageSource,
    /// Image and resources
    pub node_spec: ElasticsearchNodeSpec,
    /// Secret holding TLS material
    pub secret_name: String,
    /// Replica target of the workload itself
    pub replicas: i32,
    /// Object owning the workload
    pub owner: Option<OwnerRef>,
}

impl WorkloadTemplate {
    /// Template for every slot of a node group
    pub fn for_group(spec: &ClusterSpec, group: &NodeGroup) -> Self {
        Self {
            roles: group.roles,
            storage: group.storage.clone(),
            node_spec: group.node_spec.clone(),
            secret_name: spec.secret_name.clone(),
            replicas: REPLICAS_PER_WORKLOAD,
            owner: spec.owner.clone(),
        }
    }

    /// Hash of everything that shapes the running node, replica target aside.
    /// Stamped on each workload so template changes can be detected.
    pub fn revision(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.roles.hash(&mut hasher);
        self.storage.hash(&mut hasher);
        self.node_spec.hash(&mut hasher);
        self.secret_name.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

// =============================================================================
// Observed State
// =============================================================================

/// A workload as currently reported by the substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedWorkload {
    pub identity: WorkloadIdentity,
    /// Replica target currently set on the workload
    pub replicas: i32,
    /// Replicas reporting ready
    pub ready_replicas: i32,
    /// Template revision the workload was last written with
    pub revision: Option<String>,
}

impl ObservedWorkload {
    pub fn is_ready(&self) -> bool {
        self.replicas > 0 && self.ready_replicas >= self.replicas
    }
}

/// Workloads of one cluster, keyed by identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedState {
    workloads: BTreeMap<WorkloadIdentity, ObservedWorkload>,
}

impl ObservedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, workload: ObservedWorkload) {
        self.workloads.insert(workload.identity.clone(), workload);
    }

    pub fn get(&self, identity: &WorkloadIdentity) -> Option<&ObservedWorkload> {
        self.workloads.get(identity)
    }

    pub fn contains(&self, identity: &WorkloadIdentity) -> bool {
        self.workloads.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }

    /// Workloads in (group, replica) order
    pub fn iter(&self) -> impl Iterator<Item = &ObservedWorkload> {
        self.workloads.values()
    }

    pub fn ready_count(&self) -> usize {
        self.workloads.values().filter(|w| w.is_ready()).count()
    }
}

impl FromIterator<ObservedWorkload> for ObservedState {
    fn from_iter<I: IntoIterator<Item = ObservedWorkload>>(iter: I) -> Self {
        let mut state = Self::new();
        for workload in iter {
            state.insert(workload);
        }
        state
    }
}

// =============================================================================
// Workload API Port
// =============================================================================

/// Port for the orchestration substrate running the workloads
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Create a workload
    async fn create(&self, identity: &WorkloadIdentity, template: &WorkloadTemplate) -> Result<()>;

    /// Set the replica target of an existing workload
    async fn update(&self, identity: &WorkloadIdentity, replicas: i32) -> Result<()>;

    /// Roll an existing workload onto a new template
    async fn replace(&self, identity: &WorkloadIdentity, template: &WorkloadTemplate) -> Result<()>;

    /// Delete a workload
    async fn delete(&self, identity: &WorkloadIdentity) -> Result<()>;

    /// List the workloads of a cluster with their readiness
    async fn list(&self, cluster: &ClusterKey) -> Result<ObservedState>;

    /// Check if the substrate is reachable
    async fn health_check(&self) -> Result<bool>;

    /// Get backend name
    fn backend_name(&self) -> &str;
}

pub type WorkloadApiRef = Arc<dyn WorkloadApi>;
