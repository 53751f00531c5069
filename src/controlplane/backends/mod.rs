//! Workload Backend Adapters
//!
//! Provides adapters for the workload API:
//! - Kubernetes: one Deployment per Elasticsearch node
//! - Memory: process-local map for standalone runs and tests

pub mod kubernetes;
pub mod memory;

pub use kubernetes::*;
pub use memory::*;

use crate::domain::ports::WorkloadApiRef;
use crate::error::{Error, Result};
use kube::Client;
use std::sync::Arc;

/// Which substrate runs the workloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Kubernetes,
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(BackendKind::Kubernetes),
            "memory" | "standalone" => Ok(BackendKind::Memory),
            other => Err(Error::Configuration(format!(
                "unknown workload backend '{}'",
                other
            ))),
        }
    }
}

/// Combined backend configuration
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub kubernetes: KubernetesConfig,
}

/// Factory for creating workload backends
pub struct WorkloadBackendFactory;

impl WorkloadBackendFactory {
    /// Create the backend selected by `config`. The Kubernetes backend
    /// needs a client.
    pub fn create(config: &BackendConfig, client: Option<Client>) -> Result<WorkloadApiRef> {
        match config.kind {
            BackendKind::Kubernetes => {
                let client = client.ok_or_else(|| {
                    Error::Configuration("kubernetes backend requires a client".to_string())
                })?;
                Ok(Arc::new(KubernetesWorkloads::new(
                    client,
                    config.kubernetes.clone(),
                )))
            }
            BackendKind::Memory => Ok(Arc::new(MemoryWorkloads::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert_eq!("K8S".parse::<BackendKind>().unwrap(), BackendKind::Kubernetes);
        assert!("docker".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_factory() {
        let config = BackendConfig {
            kind: BackendKind::Memory,
            ..Default::default()
        };
        let backend = WorkloadBackendFactory::create(&config, None).unwrap();
        assert_eq!(backend.backend_name(), "memory");

        let result = WorkloadBackendFactory::create(&BackendConfig::default(), None);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
