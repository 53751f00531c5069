//! Elasticsearch CRD
//!
//! Declares a multi-node Elasticsearch cluster as an ordered list of node
//! groups. Each group carries its role set, replica count and storage source.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Elasticsearch CRD
// =============================================================================

/// Elasticsearch describes the desired topology of a managed search cluster.
/// The operator converges one workload per (node group, replica slot).
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "logging.openshift.io",
    version = "v1alpha1",
    kind = "Elasticsearch",
    plural = "elasticsearches",
    shortname = "es",
    status = "ElasticsearchStatus",
    printcolumn = r#"{"name": "Nodes", "type": "integer", "jsonPath": ".status.desiredWorkloads"}"#,
    printcolumn = r#"{"name": "Ready", "type": "integer", "jsonPath": ".status.readyWorkloads"}"#,
    printcolumn = r#"{"name": "Masters", "type": "integer", "jsonPath": ".status.masterCount"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchSpec {
    /// Container settings shared by every node group
    #[serde(default)]
    pub node_spec: ElasticsearchNodeSpec,

    /// Ordered node groups; a group's position names its workloads
    #[serde(default)]
    pub nodes: Vec<ElasticsearchNode>,

    /// Secret holding the cluster's TLS material
    #[serde(default)]
    pub secret_name: String,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Container settings for Elasticsearch nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchNodeSpec {
    /// Elasticsearch image
    #[serde(default)]
    pub image: Option<String>,

    /// CPU request and limit (e.g., "500m")
    #[serde(default)]
    pub cpu: Option<String>,

    /// Memory request and limit (e.g., "2Gi")
    #[serde(default)]
    pub memory: Option<String>,
}

/// One node group of the cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchNode {
    /// Roles of every node in this group: client, data, master
    #[serde(default)]
    pub roles: Vec<String>,

    /// Number of nodes in this group
    #[serde(default)]
    pub replicas: i32,

    /// Storage source for node data
    #[serde(default)]
    pub storage: ElasticsearchNodeStorage,

    /// Per-group override of the shared node settings
    #[serde(default)]
    pub node_spec: Option<ElasticsearchNodeSpec>,
}

/// Storage source for a node group. At most one variant may be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchNodeStorage {
    /// Ephemeral node-local storage
    #[serde(default)]
    pub empty_dir: Option<EmptyDirStorage>,

    /// Persistent volume claim created per node
    #[serde(default)]
    pub volume_claim_template: Option<VolumeClaimTemplate>,
}

/// Ephemeral storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirStorage {
    /// Storage medium ("" or "Memory")
    #[serde(default)]
    pub medium: Option<String>,

    /// Size limit (e.g., "10Gi")
    #[serde(default)]
    pub size_limit: Option<String>,
}

/// Persistent volume claim template
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    /// Storage class to request
    #[serde(default)]
    pub storage_class_name: Option<String>,

    /// Requested size (e.g., "100Gi")
    pub size: String,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the Elasticsearch cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Generation the status reflects
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Master-eligible replicas of the last accepted spec
    #[serde(default)]
    pub master_count: u32,

    /// Configured master ceiling
    #[serde(default)]
    pub max_masters: u32,

    /// Workloads the accepted topology asks for
    #[serde(default)]
    pub desired_workloads: u32,

    /// Workloads currently reporting ready
    #[serde(default)]
    pub ready_workloads: u32,

    /// Human-readable summary of the last pass
    #[serde(default)]
    pub message: Option<String>,

    /// Last reconcile time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_reconcile_time: Option<DateTime<Utc>>,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

/// Cluster lifecycle phase
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum ClusterPhase {
    #[default]
    Unreconciled,
    Reconciling,
    Converged,
    Rejected,
    Invalid,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Unreconciled => write!(f, "Unreconciled"),
            ClusterPhase::Reconciling => write!(f, "Reconciling"),
            ClusterPhase::Converged => write!(f, "Converged"),
            ClusterPhase::Rejected => write!(f, "Rejected"),
            ClusterPhase::Invalid => write!(f, "Invalid"),
        }
    }
}

/// Condition for cluster status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

impl ClusterCondition {
    /// Build a condition stamped with the current time
    pub fn new(
        r#type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: r#type.to_string(),
            status,
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

/// Condition status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition type reporting whether the spec passed the quorum guard
pub const CONDITION_QUORUM_SAFE: &str = "QuorumSafe";

/// Condition type reporting whether all workloads exist and are ready
pub const CONDITION_CONVERGED: &str = "Converged";

// =============================================================================
// Implementations
// =============================================================================

impl Elasticsearch {
    /// Get the name of this cluster
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Get the namespace of this cluster
    pub fn namespace_or_default(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }
}

impl ElasticsearchStatus {
    /// Set a condition, replacing existing if same type.
    /// The transition time is kept when the status value did not change.
    pub fn set_condition(&mut self, mut condition: ClusterCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    /// Check if the cluster has converged
    pub fn is_converged(&self) -> bool {
        self.phase == ClusterPhase::Converged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(format!("{}", ClusterPhase::Converged), "Converged");
        assert_eq!(format!("{}", ClusterPhase::default()), "Unreconciled");
    }

    #[test]
    fn test_spec_deserializes_camel_case() {
        let spec: ElasticsearchSpec = serde_json::from_value(serde_json::json!({
            "nodeSpec": { "image": "openshift/origin-logging-elasticsearch5:latest", "cpu": "500m", "memory": "2Gi" },
            "nodes": [
                { "roles": ["client", "data", "master"], "replicas": 1, "storage": { "emptyDir": {} } }
            ],
            "secretName": "elasticsearch"
        }))
        .unwrap();

        assert_eq!(spec.nodes.len(), 1);
        assert_eq!(spec.nodes[0].replicas, 1);
        assert!(spec.nodes[0].storage.empty_dir.is_some());
        assert_eq!(spec.node_spec.memory.as_deref(), Some("2Gi"));
        assert_eq!(spec.secret_name, "elasticsearch");
    }

    #[test]
    fn test_set_condition_replaces_by_type() {
        let mut status = ElasticsearchStatus::default();
        status.set_condition(ClusterCondition::new(
            CONDITION_QUORUM_SAFE,
            ConditionStatus::True,
            "WithinLimit",
            "3/3 masters",
        ));
        status.set_condition(ClusterCondition::new(
            CONDITION_QUORUM_SAFE,
            ConditionStatus::False,
            "QuorumExceeded",
            "4/3 masters",
        ));

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::False);
    }
}
