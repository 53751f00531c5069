//! Cluster topology
//!
//! Typed desired state, workload naming and the quorum safety check.

pub mod model;
pub mod naming;
pub mod quorum;

pub use model::*;
pub use naming::*;
pub use quorum::*;
