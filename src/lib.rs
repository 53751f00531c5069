//! Elasticsearch Operator
//!
//! A Kubernetes operator that turns an `Elasticsearch` resource, an ordered
//! list of node groups, into one workload per (group, replica) slot and
//! keeps the two in step. Topology changes that would push the number of
//! master-eligible nodes past a safe ceiling are refused before anything
//! is touched.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │        Kubernetes watch (controller)  /  REST API (standalone)       │
//! └──────────────────────────────────┬───────────────────────────────────┘
//!                                    │ desired ClusterSpec
//! ┌──────────────────────────────────┴───────────────────────────────────┐
//! │                        Cluster Controller                            │
//! │   per-cluster serialization · coalescing · phase record · events     │
//! │  ┌───────────────┐   ┌────────────────────┐   ┌──────────────────┐   │
//! │  │ Quorum Guard  │──▶│ Reconciler (plan)  │──▶│ intents in order │   │
//! │  └───────────────┘   └────────────────────┘   └────────┬─────────┘   │
//! └────────────────────────────────────────────────────────┼─────────────┘
//!                                                          │
//! ┌────────────────────────────────────────────────────────┴─────────────┐
//! │                         Workload API                                 │
//! │        Kubernetes (Deployments)     │     Memory (standalone)        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`topology`]: Desired-state model, workload naming and the quorum guard
//! - [`controlplane`]: Reconciler, cluster controller, backends and APIs
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Workload API port
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod topology;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, BackendConfig, BackendKind, ClusterController, ControllerConfig,
    ControllerEvent, Intent, MemoryWorkloads, PassOutcome, ReconcilePlan, Reconciler,
    WorkloadBackendFactory,
};

pub use crd::{
    ClusterPhase, Elasticsearch, ElasticsearchNode, ElasticsearchSpec, ElasticsearchStatus,
};

pub use domain::ports::{ObservedState, ObservedWorkload, WorkloadApi, WorkloadTemplate};

pub use error::{Error, ErrorAction, ErrorKind, Result};

pub use topology::{
    identify, ClusterKey, ClusterSpec, NodeGroup, NodeRole, QuorumGuard, RoleSet,
    WorkloadIdentity,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
