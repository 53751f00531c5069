//! Error types for the Elasticsearch Operator
//!
//! Provides structured error types for topology validation, quorum safety,
//! workload API failures and the surrounding Kubernetes plumbing.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Topology Validation Errors
    // =========================================================================
    #[error("Invalid role set for node group {group}: {reason}")]
    InvalidRoleSet { group: usize, reason: String },

    #[error("Invalid replica count for node group {group}: {replicas}")]
    InvalidReplicas { group: usize, replicas: i64 },

    #[error("Invalid storage for node group {group}: {reason}")]
    InvalidStorage { group: usize, reason: String },

    #[error("Invalid cluster spec: {0}")]
    InvalidSpec(String),

    // =========================================================================
    // Safety Policy Errors
    // =========================================================================
    #[error(
        "Quorum exceeded for cluster {cluster}: {master_count} master-eligible replicas requested, maximum is {max_masters}"
    )]
    QuorumExceeded {
        cluster: String,
        master_count: u32,
        max_masters: u32,
    },

    // =========================================================================
    // Workload API Errors
    // =========================================================================
    #[error("Workload API {operation} failed for {workload}: {reason}")]
    WorkloadApi {
        operation: String,
        workload: String,
        reason: String,
    },

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of errors surfaced to users and status fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRoleSet,
    InvalidReplicas,
    InvalidStorage,
    InvalidSpec,
    QuorumExceeded,
    WorkloadApiError,
    Configuration,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidRoleSet => write!(f, "InvalidRoleSet"),
            ErrorKind::InvalidReplicas => write!(f, "InvalidReplicas"),
            ErrorKind::InvalidStorage => write!(f, "InvalidStorage"),
            ErrorKind::InvalidSpec => write!(f, "InvalidSpec"),
            ErrorKind::QuorumExceeded => write!(f, "QuorumExceeded"),
            ErrorKind::WorkloadApiError => write!(f, "WorkloadApiError"),
            ErrorKind::Configuration => write!(f, "Configuration"),
            ErrorKind::Internal => write!(f, "Internal"),
        }
    }
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRoleSet { .. } => ErrorKind::InvalidRoleSet,
            Error::InvalidReplicas { .. } => ErrorKind::InvalidReplicas,
            Error::InvalidStorage { .. } => ErrorKind::InvalidStorage,
            Error::InvalidSpec(_) | Error::ApiValidation(_) => ErrorKind::InvalidSpec,
            Error::YamlParse(_) | Error::JsonParse(_) => ErrorKind::InvalidSpec,
            Error::QuorumExceeded { .. } => ErrorKind::QuorumExceeded,
            Error::WorkloadApi { .. } | Error::Kube(_) | Error::ResourceNotFound { .. } => {
                ErrorKind::WorkloadApiError
            }
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Internal(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::WorkloadApi { .. } => ErrorAction::RequeueWithBackoff,

            // Resource vanished underneath us - check again shortly
            Error::ResourceNotFound { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // User input and policy rejections - wait for a new spec
            Error::InvalidRoleSet { .. }
            | Error::InvalidReplicas { .. }
            | Error::InvalidStorage { .. }
            | Error::InvalidSpec(_)
            | Error::QuorumExceeded { .. }
            | Error::Configuration(_)
            | Error::ApiValidation(_)
            | Error::YamlParse(_)
            | Error::JsonParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error rejects the desired state rather than the attempt
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidRoleSet
                | ErrorKind::InvalidReplicas
                | ErrorKind::InvalidStorage
                | ErrorKind::InvalidSpec
                | ErrorKind::QuorumExceeded
        )
    }

    /// Shorthand for a failed workload API call
    pub fn workload_api(
        operation: impl Into<String>,
        workload: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::WorkloadApi {
            operation: operation.into(),
            workload: workload.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::QuorumExceeded {
            cluster: "es".into(),
            master_count: 4,
            max_masters: 3,
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert_eq!(err.kind(), ErrorKind::QuorumExceeded);

        let err = Error::workload_api("create", "es-data-0-1", "connection reset");
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
        assert_eq!(err.kind(), ErrorKind::WorkloadApiError);

        let err = Error::ResourceNotFound {
            kind: "Deployment".into(),
            name: "es-data-0-1".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_rejections_are_not_retried() {
        let invalid = Error::InvalidReplicas {
            group: 0,
            replicas: -1,
        };
        assert!(invalid.is_rejection());
        assert!(!invalid.is_retryable());

        let transient = Error::workload_api("list", "es", "timeout");
        assert!(!transient.is_rejection());
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_quorum_message_carries_counts() {
        let err = Error::QuorumExceeded {
            cluster: "logging/es".into(),
            master_count: 4,
            max_masters: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("4 master-eligible"));
        assert!(msg.contains("maximum is 3"));
    }
}
