//! Per-cluster reconciliation state
//!
//! Tracks where each cluster is in its lifecycle, what it last accepted or
//! rejected, and emits events for observers of the controller.

use crate::crd::{
    ClusterCondition, ClusterPhase, ConditionStatus, ElasticsearchStatus, CONDITION_CONVERGED,
    CONDITION_QUORUM_SAFE,
};
use crate::error::{Error, Result};
use crate::topology::{ClusterKey, ClusterSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Phase Transitions
// =============================================================================

/// Whether a cluster may move from `from` to `to`.
///
/// ```text
/// Unreconciled -> Reconciling -> Converged
///                      |  ^          |
///                      v  |          |
///                   Rejected <-------+ (via Reconciling)
/// ```
/// Invalid is reachable from every phase and left through Reconciling.
pub fn can_transition(from: ClusterPhase, to: ClusterPhase) -> bool {
    use ClusterPhase::*;

    if from == to || to == Invalid {
        return true;
    }
    matches!(
        (from, to),
        (Unreconciled, Reconciling)
            | (Reconciling, Converged)
            | (Reconciling, Rejected)
            | (Converged, Reconciling)
            | (Rejected, Reconciling)
            | (Invalid, Reconciling)
    )
}

// =============================================================================
// Cluster Record
// =============================================================================

/// Last spec refused by the quorum guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub master_count: u32,
    pub max_masters: u32,
    pub fingerprint: u64,
    pub at: DateTime<Utc>,
}

/// State the controller keeps for one cluster between passes
#[derive(Debug, Clone)]
pub struct ClusterRecord {
    pub key: ClusterKey,
    pub phase: ClusterPhase,
    /// Generation of the last spec a pass ran against
    pub generation: Option<i64>,
    /// Last spec that passed the guard
    pub accepted: Option<ClusterSpec>,
    pub rejection: Option<Rejection>,
    pub last_error: Option<String>,
    pub master_count: u32,
    pub max_masters: u32,
    pub desired_workloads: u32,
    pub ready_workloads: u32,
    /// Names of the workloads seen on the last pass
    pub workloads: Vec<String>,
    pub passes: u64,
    pub last_pass: Option<DateTime<Utc>>,
}

impl ClusterRecord {
    pub fn new(key: ClusterKey, max_masters: u32) -> Self {
        Self {
            key,
            phase: ClusterPhase::Unreconciled,
            generation: None,
            accepted: None,
            rejection: None,
            last_error: None,
            master_count: 0,
            max_masters,
            desired_workloads: 0,
            ready_workloads: 0,
            workloads: Vec::new(),
            passes: 0,
            last_pass: None,
        }
    }

    /// Move to another phase, refusing transitions outside the table
    pub fn transition(&mut self, to: ClusterPhase) -> Result<()> {
        if !can_transition(self.phase, to) {
            return Err(Error::Internal(format!(
                "cluster {}: illegal phase transition {} -> {}",
                self.key, self.phase, to
            )));
        }
        self.phase = to;
        Ok(())
    }

    /// Whether `spec` is the very spec that was last rejected
    pub fn is_same_rejection(&self, spec: &ClusterSpec) -> bool {
        self.phase == ClusterPhase::Rejected
            && self
                .rejection
                .as_ref()
                .is_some_and(|r| r.fingerprint == spec.fingerprint())
    }

    /// One-line summary for status fields
    pub fn message(&self) -> String {
        match self.phase {
            ClusterPhase::Unreconciled => "waiting for first reconciliation".to_string(),
            ClusterPhase::Reconciling => match &self.last_error {
                Some(err) => format!("reconciling, last attempt failed: {}", err),
                None => format!(
                    "{}/{} workloads ready",
                    self.ready_workloads, self.desired_workloads
                ),
            },
            ClusterPhase::Converged => {
                format!("all {} workloads ready", self.desired_workloads)
            }
            ClusterPhase::Rejected => match &self.rejection {
                Some(r) => format!(
                    "QuorumExceeded: {} master-eligible replicas requested, maximum is {}",
                    r.master_count, r.max_masters
                ),
                None => "rejected".to_string(),
            },
            ClusterPhase::Invalid => self
                .last_error
                .clone()
                .unwrap_or_else(|| "invalid spec".to_string()),
        }
    }

    /// Snapshot for the REST API
    pub fn view(&self) -> ClusterStatusView {
        ClusterStatusView {
            namespace: self.key.namespace.clone(),
            name: self.key.name.clone(),
            phase: self.phase,
            master_count: self.master_count,
            max_masters: self.max_masters,
            desired_workloads: self.desired_workloads,
            ready_workloads: self.ready_workloads,
            message: self.message(),
            workloads: self.workloads.clone(),
            passes: self.passes,
            last_reconcile_time: self.last_pass,
        }
    }

    /// Status subresource for the `Elasticsearch` object
    pub fn to_resource_status(&self, previous: Option<&ElasticsearchStatus>) -> ElasticsearchStatus {
        let mut status = previous.cloned().unwrap_or_default();
        status.phase = self.phase;
        status.observed_generation = self.generation;
        status.master_count = self.master_count;
        status.max_masters = self.max_masters;
        status.desired_workloads = self.desired_workloads;
        status.ready_workloads = self.ready_workloads;
        status.message = Some(self.message());
        status.last_reconcile_time = self.last_pass;

        match self.phase {
            ClusterPhase::Rejected => status.set_condition(ClusterCondition::new(
                CONDITION_QUORUM_SAFE,
                ConditionStatus::False,
                "QuorumExceeded",
                self.message(),
            )),
            ClusterPhase::Reconciling | ClusterPhase::Converged => {
                status.set_condition(ClusterCondition::new(
                    CONDITION_QUORUM_SAFE,
                    ConditionStatus::True,
                    "WithinLimit",
                    format!("{}/{} master-eligible replicas", self.master_count, self.max_masters),
                ))
            }
            _ => {}
        }

        let converged = if self.phase == ClusterPhase::Converged {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        status.set_condition(ClusterCondition::new(
            CONDITION_CONVERGED,
            converged,
            &self.phase.to_string(),
            self.message(),
        ));

        status
    }
}

/// Cluster state as reported by the REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusView {
    pub namespace: String,
    pub name: String,
    pub phase: ClusterPhase,
    pub master_count: u32,
    pub max_masters: u32,
    pub desired_workloads: u32,
    pub ready_workloads: u32,
    pub message: String,
    pub workloads: Vec<String>,
    pub passes: u64,
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Events
// =============================================================================

/// Events emitted by the controller for external consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerEvent {
    /// A pass started for a cluster
    PassStarted { cluster: String },

    /// An intent was applied to the substrate
    IntentApplied {
        cluster: String,
        kind: String,
        workload: String,
    },

    /// All desired workloads exist and are ready
    Converged { cluster: String, workloads: u32 },

    /// The quorum guard refused the desired spec
    Rejected {
        cluster: String,
        master_count: u32,
        max_masters: u32,
    },

    /// The desired spec failed validation
    Invalid { cluster: String, reason: String },

    /// A pass stopped on a workload API error
    PassFailed { cluster: String, error: String },

    /// A cluster was removed from the controller
    Forgotten { cluster: String },
}

impl ControllerEvent {
    /// Get the cluster associated with this event
    pub fn cluster(&self) -> &str {
        match self {
            ControllerEvent::PassStarted { cluster } => cluster,
            ControllerEvent::IntentApplied { cluster, .. } => cluster,
            ControllerEvent::Converged { cluster, .. } => cluster,
            ControllerEvent::Rejected { cluster, .. } => cluster,
            ControllerEvent::Invalid { cluster, .. } => cluster,
            ControllerEvent::PassFailed { cluster, .. } => cluster,
            ControllerEvent::Forgotten { cluster } => cluster,
        }
    }
}
