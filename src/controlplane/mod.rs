//! Control Plane Module
//!
//! Converges Elasticsearch clusters onto their declared topology: plans
//! workload intents, applies them through a workload backend and reports
//! the outcome over the status subresource and a REST API.

pub mod api;
pub mod backends;
pub mod controller;
pub mod metrics;
pub mod orchestrator;
pub mod reconciler;
pub mod state;

pub use api::*;
pub use backends::*;
pub use metrics::ControllerMetrics;
pub use orchestrator::*;
pub use reconciler::*;
pub use state::*;
