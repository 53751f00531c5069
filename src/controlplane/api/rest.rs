//! REST API Handlers
//!
//! Read access to cluster status and workloads. In standalone mode the API
//! also accepts desired specs, standing in for the Kubernetes watch.

use crate::controlplane::orchestrator::ClusterController;
use crate::crd::ElasticsearchSpec;
use crate::error::{Error, ErrorKind};
use crate::topology::{ClusterKey, ClusterSpec};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// One workload of a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadResponse {
    pub name: String,
    pub group: u32,
    pub replica: u32,
    pub roles: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub ready: bool,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiErrorResponse {
            error: error.into(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

/// Map a controller error onto an HTTP response
fn controller_error(e: &Error) -> Response {
    let status = match e.kind() {
        ErrorKind::QuorumExceeded => StatusCode::CONFLICT,
        ErrorKind::InvalidRoleSet
        | ErrorKind::InvalidReplicas
        | ErrorKind::InvalidStorage
        | ErrorKind::InvalidSpec => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::WorkloadApiError => StatusCode::BAD_GATEWAY,
        ErrorKind::Configuration | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiErrorResponse {
            error: e.kind().to_string(),
            message: e.to_string(),
            details: None,
        }),
    )
        .into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    controller: Arc<ClusterController>,
    accept_submissions: bool,
}

impl RestRouter {
    /// Create a read-only REST router
    pub fn new(controller: Arc<ClusterController>) -> Self {
        Self {
            controller,
            accept_submissions: false,
        }
    }

    /// Allow desired specs to be submitted and removed over the API
    pub fn with_submissions(mut self, enabled: bool) -> Self {
        self.accept_submissions = enabled;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            controller: self.controller,
        };

        let cluster = if self.accept_submissions {
            get(get_cluster).put(put_cluster).delete(delete_cluster)
        } else {
            get(get_cluster)
        };

        Router::new()
            // Cluster endpoints
            .route("/v1/clusters", get(list_clusters))
            .route("/v1/clusters/:namespace/:name", cluster)
            .route("/v1/clusters/:namespace/:name/workloads", get(list_workloads))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    controller: Arc<ClusterController>,
}

// =============================================================================
// Handlers
// =============================================================================

/// List every known cluster
async fn list_clusters(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.statuses())
}

/// Get one cluster
async fn get_cluster(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let key = ClusterKey::new(namespace, name);
    match state.controller.status(&key) {
        Some(view) => (StatusCode::OK, Json(view)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Cluster {} not found", key),
        ),
    }
}

/// Submit the desired spec of a cluster
async fn put_cluster(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(spec): Json<ElasticsearchSpec>,
) -> Response {
    let key = ClusterKey::new(namespace, name);
    info!(cluster = %key, "Desired spec submitted");

    let desired = match ClusterSpec::from_parts(key.clone(), &spec) {
        Ok(desired) => desired,
        Err(e) => {
            state.controller.record_invalid(&key, None, &e).await;
            return controller_error(&e);
        }
    };

    // The pass outlives a dropped connection
    let controller = state.controller.clone();
    let submitted = tokio::spawn(async move { controller.submit(desired).await });
    let outcome = match submitted.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(cluster = %key, error = %e, "Reconcile task failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("Reconcile task for {} failed", key),
            );
        }
    };

    match outcome {
        Some(Ok(_)) => match state.controller.status(&key) {
            Some(view) => (StatusCode::OK, Json(view)).into_response(),
            None => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("Cluster {} vanished during reconciliation", key),
            ),
        },
        Some(Err(e)) => {
            if !e.is_rejection() {
                error!(cluster = %key, error = %e, "Reconcile pass failed");
            }
            controller_error(&e)
        }
        // A pass is in flight and will pick the spec up
        None => match state.controller.status(&key) {
            Some(view) => (StatusCode::ACCEPTED, Json(view)).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        },
    }
}

/// Remove a cluster and its workloads
async fn delete_cluster(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let key = ClusterKey::new(namespace, name);
    if state.controller.status(&key).is_none() {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Cluster {} not found", key),
        );
    }

    match state.controller.forget(&key).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(cluster = %key, error = %e, "Cluster removal failed");
            controller_error(&e)
        }
    }
}

/// List the workloads of a cluster as the substrate reports them
async fn list_workloads(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let key = ClusterKey::new(namespace, name);
    if state.controller.status(&key).is_none() {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Cluster {} not found", key),
        );
    }

    match state.controller.workloads().list(&key).await {
        Ok(observed) => {
            let workloads: Vec<WorkloadResponse> = observed
                .iter()
                .map(|w| WorkloadResponse {
                    name: w.identity.name(),
                    group: w.identity.group_index,
                    replica: w.identity.replica_index,
                    roles: w.identity.roles.to_csv(),
                    replicas: w.replicas,
                    ready_replicas: w.ready_replicas,
                    ready: w.is_ready(),
                })
                .collect();
            (StatusCode::OK, Json(workloads)).into_response()
        }
        Err(e) => controller_error(&e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.controller.workloads().health_check().await {
        Ok(true) => (StatusCode::OK, "ready"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "workload backend unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::MemoryWorkloads;
    use crate::controlplane::orchestrator::ControllerConfig;
    use crate::controlplane::state::ClusterStatusView;
    use crate::crd::{ClusterPhase, ElasticsearchNode};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn controller() -> (Arc<ClusterController>, Arc<MemoryWorkloads>) {
        let memory = Arc::new(MemoryWorkloads::new());
        let controller =
            ClusterController::new(ControllerConfig::default(), memory.clone()).unwrap();
        (controller, memory)
    }

    fn spec_body(groups: Vec<(Vec<&str>, i32)>) -> Body {
        let spec = ElasticsearchSpec {
            nodes: groups
                .into_iter()
                .map(|(roles, replicas)| ElasticsearchNode {
                    roles: roles.iter().map(|r| r.to_string()).collect(),
                    replicas,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        Body::from(serde_json::to_vec(&spec).unwrap())
    }

    fn put(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (controller, _) = controller();
        let app = RestRouter::new(controller).build();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_not_found() {
        let (controller, _) = controller();
        let app = RestRouter::new(controller).build();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/clusters/default/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submissions_are_disabled_by_default() {
        let (controller, _) = controller();
        let app = RestRouter::new(controller).build();

        let response = app
            .oneshot(put(
                "/v1/clusters/default/es",
                spec_body(vec![(vec!["master"], 1)]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_put_reconciles_and_reports() {
        let (controller, memory) = controller();
        let app = RestRouter::new(controller).with_submissions(true).build();

        let response = app
            .clone()
            .oneshot(put(
                "/v1/clusters/default/es",
                spec_body(vec![(vec!["client", "data", "master"], 2)]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view: ClusterStatusView = json(response).await;
        assert_eq!(view.phase, ClusterPhase::Reconciling);
        assert_eq!(view.master_count, 2);
        assert_eq!(memory.len(), 2);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/clusters/default/es/workloads")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let workloads: Vec<WorkloadResponse> = json(response).await;
        assert_eq!(workloads[0].name, "es-clientdatamaster-0-1");
        assert_eq!(workloads[1].name, "es-clientdatamaster-0-2");
    }

    #[tokio::test]
    async fn test_put_over_quorum_conflicts() {
        let (controller, memory) = controller();
        let app = RestRouter::new(controller).with_submissions(true).build();

        let response = app
            .clone()
            .oneshot(put(
                "/v1/clusters/default/es",
                spec_body(vec![(vec!["master"], 4)]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: ApiErrorResponse = json(response).await;
        assert_eq!(body.error, "QuorumExceeded");
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_put_invalid_spec_is_unprocessable() {
        let (controller, _) = controller();
        let app = RestRouter::new(controller).with_submissions(true).build();

        let response = app
            .clone()
            .oneshot(put(
                "/v1/clusters/default/es",
                spec_body(vec![(vec!["coordinator"], 1)]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/clusters/default/es")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let view: ClusterStatusView = json(response).await;
        assert_eq!(view.phase, ClusterPhase::Invalid);
    }

    #[tokio::test]
    async fn test_delete_removes_workloads() {
        let (controller, memory) = controller();
        let app = RestRouter::new(controller).with_submissions(true).build();

        app.clone()
            .oneshot(put(
                "/v1/clusters/default/es",
                spec_body(vec![(vec!["data"], 2)]),
            ))
            .await
            .unwrap();
        assert_eq!(memory.len(), 2);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v1/clusters/default/es")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(memory.is_empty());
    }
}
