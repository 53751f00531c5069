//! Custom Resource Definitions for the Elasticsearch Operator
//!
//! This module contains the CRD types:
//! - Elasticsearch: desired node-group topology and reconciliation status

pub mod elasticsearch;

pub use elasticsearch::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
