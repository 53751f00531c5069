//! Reconciliation planner
//!
//! Diffs the desired topology against the observed workloads and produces
//! the intents that converge one onto the other. Planning is pure: it never
//! touches the substrate, and an unsafe spec yields no intents at all.

use crate::domain::ports::{ObservedState, WorkloadTemplate};
use crate::error::Result;
use crate::topology::{identify, quorum_count, ClusterSpec, QuorumGuard, WorkloadIdentity};
use std::collections::BTreeMap;

// =============================================================================
// Intents
// =============================================================================

/// A single change to apply to the substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    CreateWorkload {
        identity: WorkloadIdentity,
        template: WorkloadTemplate,
    },
    UpdateWorkloadReplicas {
        identity: WorkloadIdentity,
        replicas: i32,
    },
    /// Storage, image, resources or secret changed for an existing slot
    ReplaceWorkload {
        identity: WorkloadIdentity,
        template: WorkloadTemplate,
    },
    DeleteWorkload {
        identity: WorkloadIdentity,
    },
}

/// Intent kind, used for logging and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    Create,
    Update,
    Replace,
    Delete,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Create => "create",
            IntentKind::Update => "update",
            IntentKind::Replace => "replace",
            IntentKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Intent {
    pub fn identity(&self) -> &WorkloadIdentity {
        match self {
            Intent::CreateWorkload { identity, .. }
            | Intent::UpdateWorkloadReplicas { identity, .. }
            | Intent::ReplaceWorkload { identity, .. }
            | Intent::DeleteWorkload { identity } => identity,
        }
    }

    pub fn kind(&self) -> IntentKind {
        match self {
            Intent::CreateWorkload { .. } => IntentKind::Create,
            Intent::UpdateWorkloadReplicas { .. } => IntentKind::Update,
            Intent::ReplaceWorkload { .. } => IntentKind::Replace,
            Intent::DeleteWorkload { .. } => IntentKind::Delete,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::UpdateWorkloadReplicas { identity, replicas } => {
                write!(f, "update {} -> {} replicas", identity, replicas)
            }
            other => write!(f, "{} {}", other.kind(), other.identity()),
        }
    }
}

// =============================================================================
// Plan
// =============================================================================

/// Outcome of planning one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Intents in ascending (group, replica) order
    pub intents: Vec<Intent>,
    /// Master-eligible replicas of the accepted spec
    pub master_count: u32,
    /// Workloads the spec asks for
    pub desired_workloads: u32,
    /// Desired workloads already present and ready
    pub ready_workloads: u32,
}

impl ReconcilePlan {
    /// Nothing left to change
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Every desired workload exists, is ready, and nothing is pending
    pub fn is_converged(&self) -> bool {
        self.is_empty() && self.ready_workloads == self.desired_workloads
    }

    pub fn count(&self, kind: IntentKind) -> usize {
        self.intents.iter().filter(|i| i.kind() == kind).count()
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Pure diff of desired topology against observed workloads
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    guard: QuorumGuard,
}

impl Reconciler {
    pub fn new(guard: QuorumGuard) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &QuorumGuard {
        &self.guard
    }

    /// Plan the intents converging `observed` onto `desired`.
    ///
    /// Fails with `QuorumExceeded` before looking at `observed` when the
    /// spec asks for too many master-eligible replicas.
    pub fn plan(&self, desired: &ClusterSpec, observed: &ObservedState) -> Result<ReconcilePlan> {
        self.guard.validate(desired)?;

        let mut targets: BTreeMap<WorkloadIdentity, WorkloadTemplate> = BTreeMap::new();
        for (index, group) in desired.groups.iter().enumerate() {
            let template = WorkloadTemplate::for_group(desired, group);
            for replica in 1..=group.replicas {
                targets.insert(
                    identify(&desired.key, index, replica, group.roles),
                    template.clone(),
                );
            }
        }

        let mut intents = Vec::new();
        let mut ready_workloads = 0;

        for (identity, template) in &targets {
            match observed.get(identity) {
                None => intents.push(Intent::CreateWorkload {
                    identity: identity.clone(),
                    template: template.clone(),
                }),
                // Replacing also resets the replica target
                Some(current) if current.revision.as_deref() != Some(template.revision().as_str()) => {
                    intents.push(Intent::ReplaceWorkload {
                        identity: identity.clone(),
                        template: template.clone(),
                    })
                }
                Some(current) if current.replicas != template.replicas => {
                    intents.push(Intent::UpdateWorkloadReplicas {
                        identity: identity.clone(),
                        replicas: template.replicas,
                    })
                }
                Some(current) => {
                    if current.is_ready() {
                        ready_workloads += 1;
                    }
                }
            }
        }

        // Removed groups and scaled-down slots
        for current in observed.iter() {
            if !targets.contains_key(&current.identity) {
                intents.push(Intent::DeleteWorkload {
                    identity: current.identity.clone(),
                });
            }
        }

        intents.sort_by(|a, b| a.identity().cmp(b.identity()));

        Ok(ReconcilePlan {
            intents,
            master_count: quorum_count(desired),
            desired_workloads: u32::try_from(targets.len()).unwrap_or(u32::MAX),
            ready_workloads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ObservedWorkload;
    use crate::error::Error;
    use crate::topology::{ClusterKey, NodeGroup, NodeRole, RoleSet, StorageSource};
    use assert_matches::assert_matches;

    fn all_roles() -> RoleSet {
        RoleSet::from_roles(NodeRole::ALL)
    }

    fn key() -> ClusterKey {
        ClusterKey::new("default", "c")
    }

    fn spec(replicas: &[u32]) -> ClusterSpec {
        replicas.iter().fold(ClusterSpec::new(key()), |s, r| {
            s.with_group(NodeGroup::new(all_roles(), *r))
        })
    }

    /// Observed state after applying every intent of a plan, all ready
    fn apply(observed: &ObservedState, plan: &ReconcilePlan) -> ObservedState {
        let mut next = observed.clone();
        let mut deleted = Vec::new();
        for intent in &plan.intents {
            match intent {
                Intent::CreateWorkload { identity, template }
                | Intent::ReplaceWorkload { identity, template } => next.insert(ObservedWorkload {
                    identity: identity.clone(),
                    replicas: template.replicas,
                    ready_replicas: template.replicas,
                    revision: Some(template.revision()),
                }),
                Intent::UpdateWorkloadReplicas { identity, replicas } => {
                    let mut current = observed.get(identity).cloned().unwrap();
                    current.replicas = *replicas;
                    current.ready_replicas = *replicas;
                    next.insert(current)
                }
                Intent::DeleteWorkload { identity } => deleted.push(identity.clone()),
            }
        }
        next.iter()
            .filter(|w| !deleted.contains(&w.identity))
            .cloned()
            .collect()
    }

    #[test]
    fn test_empty_observed_creates_every_slot() {
        let reconciler = Reconciler::default();
        let plan = reconciler
            .plan(&spec(&[2, 1]), &ObservedState::new())
            .unwrap();

        assert_eq!(plan.intents.len(), 3);
        assert_eq!(plan.count(IntentKind::Create), 3);
        let names: Vec<String> = plan.intents.iter().map(|i| i.identity().name()).collect();
        assert_eq!(
            names,
            vec![
                "c-clientdatamaster-0-1",
                "c-clientdatamaster-0-2",
                "c-clientdatamaster-1-1"
            ]
        );
        assert_eq!(plan.master_count, 3);
        assert_eq!(plan.desired_workloads, 3);
    }

    #[test]
    fn test_replanning_after_apply_is_a_fixed_point() {
        let reconciler = Reconciler::default();
        let desired = spec(&[2, 1]);
        let first = reconciler.plan(&desired, &ObservedState::new()).unwrap();
        let observed = apply(&ObservedState::new(), &first);

        let second = reconciler.plan(&desired, &observed).unwrap();
        assert!(second.is_empty());
        assert!(second.is_converged());
    }

    #[test]
    fn test_scale_up_creates_only_new_slots() {
        let reconciler = Reconciler::default();
        let observed = apply(
            &ObservedState::new(),
            &reconciler.plan(&spec(&[1]), &ObservedState::new()).unwrap(),
        );

        let plan = reconciler.plan(&spec(&[3]), &observed).unwrap();
        assert_eq!(plan.intents.len(), 2);
        assert_eq!(plan.count(IntentKind::Create), 2);
        let slots: Vec<_> = plan.intents.iter().map(|i| i.identity().slot()).collect();
        assert_eq!(slots, vec![(0, 2), (0, 3)]);
    }

    #[test]
    fn test_scale_down_and_group_removal_delete() {
        let reconciler = Reconciler::default();
        let observed = apply(
            &ObservedState::new(),
            &reconciler.plan(&spec(&[2, 1]), &ObservedState::new()).unwrap(),
        );

        let plan = reconciler.plan(&spec(&[1]), &observed).unwrap();
        assert_eq!(plan.count(IntentKind::Delete), 2);
        assert_eq!(plan.count(IntentKind::Create), 0);
        let slots: Vec<_> = plan.intents.iter().map(|i| i.identity().slot()).collect();
        assert_eq!(slots, vec![(0, 2), (1, 1)]);
    }

    fn revision_of(spec: &ClusterSpec, group: usize) -> Option<String> {
        Some(WorkloadTemplate::for_group(spec, &spec.groups[group]).revision())
    }

    #[test]
    fn test_drifted_replicas_are_updated() {
        let reconciler = Reconciler::default();
        let identity = identify(&key(), 0, 1, all_roles());
        let observed: ObservedState = vec![ObservedWorkload {
            identity: identity.clone(),
            replicas: 0,
            ready_replicas: 0,
            revision: revision_of(&spec(&[1]), 0),
        }]
        .into_iter()
        .collect();

        let plan = reconciler.plan(&spec(&[1]), &observed).unwrap();
        assert_eq!(
            plan.intents,
            vec![Intent::UpdateWorkloadReplicas {
                identity,
                replicas: 1
            }]
        );
    }

    #[test]
    fn test_unready_workloads_are_not_converged() {
        let reconciler = Reconciler::default();
        let observed: ObservedState = vec![ObservedWorkload {
            identity: identify(&key(), 0, 1, all_roles()),
            replicas: 1,
            ready_replicas: 0,
            revision: revision_of(&spec(&[1]), 0),
        }]
        .into_iter()
        .collect();

        let plan = reconciler.plan(&spec(&[1]), &observed).unwrap();
        assert!(plan.is_empty());
        assert!(!plan.is_converged());
    }

    #[test]
    fn test_quorum_violation_emits_nothing() {
        let reconciler = Reconciler::default();
        let observed = apply(
            &ObservedState::new(),
            &reconciler.plan(&spec(&[2, 1]), &ObservedState::new()).unwrap(),
        );

        let result = reconciler.plan(&spec(&[2, 2]), &observed);
        assert_matches!(
            result,
            Err(Error::QuorumExceeded {
                master_count: 4,
                max_masters: 3,
                ..
            })
        );
    }

    #[test]
    fn test_storage_change_replaces_workload_in_place() {
        let reconciler = Reconciler::default();
        let ephemeral = spec(&[2]);
        let observed = apply(
            &ObservedState::new(),
            &reconciler.plan(&ephemeral, &ObservedState::new()).unwrap(),
        );

        let mut persistent = ephemeral.clone();
        persistent.groups[0].storage = StorageSource::PersistentVolumeClaim {
            storage_class_name: None,
            size: "20Gi".into(),
        };
        let plan = reconciler.plan(&persistent, &observed).unwrap();
        assert_eq!(plan.count(IntentKind::Replace), 2);
        assert_eq!(plan.intents.len(), 2);
        assert!(!plan.is_converged());
        match &plan.intents[0] {
            Intent::ReplaceWorkload { identity, template } => {
                assert_eq!(identity.slot(), (0, 1));
                assert!(template.storage.is_persistent());
            }
            other => panic!("unexpected intent {:?}", other),
        }

        let observed = apply(&observed, &plan);
        assert!(reconciler.plan(&persistent, &observed).unwrap().is_converged());
    }

    #[test]
    fn test_image_change_replaces_workload() {
        let reconciler = Reconciler::default();
        let before = spec(&[1]);
        let observed = apply(
            &ObservedState::new(),
            &reconciler.plan(&before, &ObservedState::new()).unwrap(),
        );

        let mut after = before.clone();
        after.groups[0].node_spec.image = Some("es:7".into());
        let plan = reconciler.plan(&after, &observed).unwrap();
        assert_eq!(plan.count(IntentKind::Replace), 1);
    }

    #[test]
    fn test_role_change_replaces_workloads() {
        let reconciler = Reconciler::default();
        let observed = apply(
            &ObservedState::new(),
            &reconciler.plan(&spec(&[1]), &ObservedState::new()).unwrap(),
        );

        let data_only = ClusterSpec::new(key())
            .with_group(NodeGroup::new(RoleSet::from_roles([NodeRole::Data]), 1));
        let plan = reconciler.plan(&data_only, &observed).unwrap();

        assert_eq!(plan.count(IntentKind::Create), 1);
        assert_eq!(plan.count(IntentKind::Delete), 1);
        assert_eq!(plan.intents[0].identity().name(), "c-data-0-1");
    }
}
