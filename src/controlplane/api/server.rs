//! API Server
//!
//! Serves the REST router with graceful shutdown.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::rest::RestRouter;
use crate::controlplane::orchestrator::ClusterController;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Accept desired specs over the API
    pub accept_submissions: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            accept_submissions: false,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST API server for the cluster controller
pub struct ApiServer {
    config: ApiServerConfig,
    controller: Arc<ClusterController>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, controller: Arc<ClusterController>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            controller,
            shutdown_tx,
        }
    }

    /// Run the API server until shutdown is triggered
    pub async fn run(&self) -> Result<()> {
        info!("Starting API server");
        info!("  REST API: {}", self.config.rest_addr);
        if self.config.accept_submissions {
            info!("  Accepting desired specs over REST");
        }

        match self.spawn_rest_server().await {
            Ok(result) => result,
            Err(e) => {
                error!("REST server task failed: {:?}", e);
                Err(Error::Internal(format!("REST server task failed: {}", e)))
            }
        }
    }

    /// Spawn the REST server
    fn spawn_rest_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let addr = self.config.rest_addr;
        let router = RestRouter::new(self.controller.clone())
            .with_submissions(self.config.accept_submissions);
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let result = run_rest_server(addr, router, shutdown_rx).await;
            if let Err(e) = &result {
                error!("REST server error: {}", e);
            }
            result
        })
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Run the REST API server
async fn run_rest_server(
    addr: SocketAddr,
    router: RestRouter,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let app = router.build();

    info!("REST API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        Error::Internal(format!("Failed to bind REST server: {}", e))
    })?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::MemoryWorkloads;
    use crate::controlplane::orchestrator::ControllerConfig;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
        assert!(!config.accept_submissions);
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let controller = ClusterController::new(
            ControllerConfig::default(),
            Arc::new(MemoryWorkloads::new()),
        )
        .unwrap();
        let server = Arc::new(ApiServer::new(
            ApiServerConfig {
                rest_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                accept_submissions: false,
            },
            controller,
        ));

        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        // The signal is only seen once the server has subscribed
        for _ in 0..500 {
            server.shutdown();
            if running.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_is_returned() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let controller = ClusterController::new(
            ControllerConfig::default(),
            Arc::new(MemoryWorkloads::new()),
        )
        .unwrap();
        let server = ApiServer::new(
            ApiServerConfig {
                rest_addr: taken.local_addr().unwrap(),
                accept_submissions: false,
            },
            controller,
        );

        let result = server.run().await;
        assert!(matches!(result, Err(Error::Internal(ref m)) if m.contains("bind")));
    }
}
