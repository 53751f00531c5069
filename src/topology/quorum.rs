//! Quorum Guard
//!
//! Bounds the number of master-eligible replicas a cluster may ask for.
//! The check runs on the whole proposed spec on every update, not on the
//! delta, so a scale-up of an already accepted cluster is caught too.

use super::model::ClusterSpec;
use crate::error::{Error, Result};

/// Default ceiling on master-eligible replicas
pub const DEFAULT_MAX_MASTERS: u32 = 3;

/// Number of master-eligible replicas across all node groups.
/// Saturates at `u32::MAX`, which no ceiling admits.
pub fn quorum_count(spec: &ClusterSpec) -> u32 {
    spec.groups
        .iter()
        .filter(|g| g.roles.is_master_eligible())
        .fold(0u32, |total, g| total.saturating_add(g.replicas))
}

/// Static ceiling on master-eligible replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumGuard {
    max_masters: u32,
}

impl QuorumGuard {
    /// Create a guard; a ceiling of zero would reject every cluster
    pub fn new(max_masters: u32) -> Result<Self> {
        if max_masters == 0 {
            return Err(Error::Configuration(
                "maximum master count must be at least 1".into(),
            ));
        }
        Ok(Self { max_masters })
    }

    pub fn max_masters(&self) -> u32 {
        self.max_masters
    }

    /// Accept or reject a proposed spec
    pub fn validate(&self, spec: &ClusterSpec) -> Result<()> {
        let master_count = quorum_count(spec);
        if master_count > self.max_masters {
            return Err(Error::QuorumExceeded {
                cluster: spec.key.to_string(),
                master_count,
                max_masters: self.max_masters,
            });
        }
        Ok(())
    }
}

impl Default for QuorumGuard {
    fn default() -> Self {
        Self {
            max_masters: DEFAULT_MAX_MASTERS,
        }
    }
}
