//! Elasticsearch Operator
//!
//! Runs the cluster controller either against Kubernetes, watching
//! `Elasticsearch` resources, or standalone with in-memory workloads and
//! desired specs submitted over REST.

use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use elasticsearch_operator::controlplane::controller as kube_controller;
use elasticsearch_operator::controlplane::ControllerMetrics;
use elasticsearch_operator::{
    ApiServer, ApiServerConfig, BackendKind, ClusterController, ClusterSpec, ControllerConfig,
    Error, Result, WorkloadBackendFactory,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Elasticsearch Operator - converges node-group topologies into workloads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Maximum master-eligible replicas per cluster
    #[arg(long, env = "MAX_MASTER_NODES", default_value = "3")]
    max_master_nodes: u32,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Elasticsearch manifest to reconcile at startup in standalone mode
    #[arg(long, env = "CLUSTER_SPEC")]
    cluster_spec: Option<PathBuf>,

    /// Image for node groups that do not name one
    #[arg(long, env = "ELASTICSEARCH_IMAGE")]
    elasticsearch_image: Option<String>,

    /// Seconds between passes while workloads are coming up
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "10")]
    resync_interval_secs: u64,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    info!("Starting Elasticsearch Operator");
    info!("  Version: {}", elasticsearch_operator::VERSION);
    info!("  Max master nodes: {}", args.max_master_nodes);
    info!("  REST API: {}", args.api_addr);
    info!("  Standalone mode: {}", args.standalone);

    // Controller configuration
    let mut config = ControllerConfig {
        max_masters: args.max_master_nodes,
        progressing_requeue_secs: args.resync_interval_secs,
        ..Default::default()
    };
    if let Some(image) = &args.elasticsearch_image {
        config.backend.kubernetes.default_image = image.clone();
    }
    config.backend.kind = if args.standalone {
        BackendKind::Memory
    } else {
        BackendKind::Kubernetes
    };

    let client = if args.standalone {
        None
    } else {
        Some(kube::Client::try_default().await?)
    };

    let workloads = WorkloadBackendFactory::create(&config.backend, client.clone())?;
    let controller = ClusterController::new(config, workloads)?;

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health server")?;
    let health_controller = controller.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_controller).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics server")?;
    let metrics = controller.metrics().clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_server = Arc::new(ApiServer::new(
        ApiServerConfig {
            rest_addr: parse_addr(&args.api_addr, "REST API")?,
            accept_submissions: args.standalone,
        },
        controller.clone(),
    ));

    match client {
        Some(client) => {
            let api = {
                let api_server = api_server.clone();
                tokio::spawn(async move { api_server.run().await })
            };

            kube_controller::run(client, controller, args.namespace.clone()).await;

            api_server.shutdown();
            if let Ok(Err(e)) = api.await {
                error!("API server error: {}", e);
            }
        }
        None => {
            if let Some(path) = &args.cluster_spec {
                seed_cluster(&controller, path).await?;
            }

            let resync = spawn_resync(
                controller.clone(),
                Duration::from_secs(args.resync_interval_secs),
            );

            let api = {
                let api_server = api_server.clone();
                tokio::spawn(async move { api_server.run().await })
            };

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            resync.abort();
            api_server.shutdown();
            if let Ok(Err(e)) = api.await {
                error!("API server error: {}", e);
            }
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address '{}': {}", what, addr, e)))
}

/// Reconcile the manifest given on the command line
async fn seed_cluster(controller: &ClusterController, path: &Path) -> Result<()> {
    let desired = ClusterSpec::load_file(path)?;
    info!(cluster = %desired.key, "Reconciling cluster from {}", path.display());

    match controller.submit(desired).await {
        Some(Err(e)) if e.is_rejection() => warn!("Seed cluster rejected: {}", e),
        Some(Err(e)) => warn!("Seed cluster pass failed, will retry: {}", e),
        _ => {}
    }
    Ok(())
}

/// Periodically revisit clusters so readiness changes are picked up
fn spawn_resync(controller: Arc<ClusterController>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            controller.resync().await;
        }
    })
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info"] {
        filter = filter.add_directive(directive.parse().map_err(|e| {
            Error::Configuration(format!("Invalid log directive '{}': {}", directive, e))
        })?);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, controller: Arc<ClusterController>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let controller = controller.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let controller = controller.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" => match controller.workloads().health_check().await {
                            Ok(true) => text_response(StatusCode::OK, "ok"),
                            _ => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, metrics: ControllerMetrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Encoding metrics failed: {}", e);
                                text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
