//! In-Memory Workload Backend
//!
//! Keeps workloads in a process-local map. Used for standalone runs and
//! tests; readiness and failures can be driven from the outside.

use crate::domain::ports::{ObservedState, ObservedWorkload, WorkloadApi, WorkloadTemplate};
use crate::error::{Error, Result};
use crate::topology::{ClusterKey, WorkloadIdentity};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A workload held by the memory backend
#[derive(Debug, Clone)]
pub struct MemoryWorkload {
    pub template: WorkloadTemplate,
    pub replicas: i32,
    pub ready_replicas: i32,
}

/// Workload API backed by a concurrent map
pub struct MemoryWorkloads {
    workloads: DashMap<WorkloadIdentity, MemoryWorkload>,
    /// New and updated workloads report ready immediately
    auto_ready: bool,
    /// Every operation fails while set
    failing: AtomicBool,
}

impl MemoryWorkloads {
    /// Backend whose workloads become ready as soon as they exist
    pub fn new() -> Self {
        Self::with_auto_ready(true)
    }

    pub fn with_auto_ready(auto_ready: bool) -> Self {
        Self {
            workloads: DashMap::new(),
            auto_ready,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail until cleared
    pub fn fail_operations(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Report a workload as fully ready
    pub fn mark_ready(&self, identity: &WorkloadIdentity) -> bool {
        match self.workloads.get_mut(identity) {
            Some(mut workload) => {
                workload.ready_replicas = workload.replicas;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_ready(&self) {
        for mut workload in self.workloads.iter_mut() {
            workload.ready_replicas = workload.replicas;
        }
    }

    pub fn get(&self, identity: &WorkloadIdentity) -> Option<MemoryWorkload> {
        self.workloads.get(identity).map(|w| w.value().clone())
    }

    /// Names of every workload, in (cluster, group, replica) order
    pub fn names(&self) -> Vec<String> {
        let mut identities: Vec<WorkloadIdentity> =
            self.workloads.iter().map(|w| w.key().clone()).collect();
        identities.sort();
        identities.iter().map(|i| i.name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workloads.iter().any(|w| w.key().name() == name)
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }

    fn check(&self, operation: &str, workload: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::workload_api(operation, workload, "injected failure"));
        }
        Ok(())
    }

    fn ready_for(&self, replicas: i32) -> i32 {
        if self.auto_ready {
            replicas
        } else {
            0
        }
    }
}

impl Default for MemoryWorkloads {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkloadApi for MemoryWorkloads {
    async fn create(&self, identity: &WorkloadIdentity, template: &WorkloadTemplate) -> Result<()> {
        let name = identity.name();
        self.check("create", &name)?;

        if self.workloads.contains_key(identity) {
            return Err(Error::workload_api("create", name, "already exists"));
        }
        self.workloads.insert(
            identity.clone(),
            MemoryWorkload {
                template: template.clone(),
                replicas: template.replicas,
                ready_replicas: self.ready_for(template.replicas),
            },
        );
        debug!("Created workload {}", name);
        Ok(())
    }

    async fn update(&self, identity: &WorkloadIdentity, replicas: i32) -> Result<()> {
        let name = identity.name();
        self.check("update", &name)?;

        let ready = self.ready_for(replicas);
        match self.workloads.get_mut(identity) {
            Some(mut workload) => {
                workload.replicas = replicas;
                workload.ready_replicas = ready.min(replicas);
                debug!("Scaled workload {} to {} replicas", name, replicas);
                Ok(())
            }
            None => Err(Error::workload_api("update", name, "not found")),
        }
    }

    async fn replace(&self, identity: &WorkloadIdentity, template: &WorkloadTemplate) -> Result<()> {
        let name = identity.name();
        self.check("replace", &name)?;

        let ready = self.ready_for(template.replicas);
        match self.workloads.get_mut(identity) {
            Some(mut workload) => {
                workload.template = template.clone();
                workload.replicas = template.replicas;
                workload.ready_replicas = ready;
                debug!("Replaced workload {}", name);
                Ok(())
            }
            None => Err(Error::workload_api("replace", name, "not found")),
        }
    }

    async fn delete(&self, identity: &WorkloadIdentity) -> Result<()> {
        let name = identity.name();
        self.check("delete", &name)?;

        if self.workloads.remove(identity).is_some() {
            debug!("Deleted workload {}", name);
        }
        Ok(())
    }

    async fn list(&self, cluster: &ClusterKey) -> Result<ObservedState> {
        self.check("list", &cluster.to_string())?;

        Ok(self
            .workloads
            .iter()
            .filter(|w| &w.key().cluster == cluster)
            .map(|w| ObservedWorkload {
                identity: w.key().clone(),
                replicas: w.replicas,
                ready_replicas: w.ready_replicas,
                revision: Some(w.template.revision()),
            })
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.failing.load(Ordering::SeqCst))
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}
