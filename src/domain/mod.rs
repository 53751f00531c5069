//! Domain layer
//!
//! Ports the reconciler talks through: the workload API contract and the
//! observed/desired workload shapes exchanged over it.

pub mod ports;

pub use ports::*;
