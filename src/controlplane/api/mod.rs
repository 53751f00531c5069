//! API Module
//!
//! REST API for cluster status and, in standalone mode, desired-state
//! submission.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
