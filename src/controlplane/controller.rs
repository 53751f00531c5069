//! Kubernetes Controller
//!
//! Watches `Elasticsearch` resources and the Deployments they own, runs a
//! pass through the cluster controller for each change and publishes the
//! outcome on the status subresource.

use crate::controlplane::orchestrator::ClusterController;
use crate::crd::{Elasticsearch, ElasticsearchStatus};
use crate::error::{Error, ErrorAction, Result};
use crate::topology::{managed_selector, ClusterKey, ClusterSpec};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Shared state handed to every reconcile call
pub struct Context {
    pub client: Client,
    pub controller: Arc<ClusterController>,
}

/// Reconcile one `Elasticsearch` resource
pub async fn reconcile(es: Arc<Elasticsearch>, ctx: Arc<Context>) -> Result<Action> {
    let key = ClusterKey::new(es.namespace_or_default(), es.name());
    debug!(cluster = %key, "Reconciling");

    if is_being_deleted(&es) {
        // Owner references take the Deployments down with the resource
        ctx.controller.release(&key).await;
        return Ok(Action::await_change());
    }

    let desired = match ClusterSpec::from_resource(&es) {
        Ok(desired) => desired,
        Err(e) => {
            ctx.controller
                .record_invalid(&key, es.metadata.generation, &e)
                .await;
            publish_status(&es, &key, &ctx).await?;
            return Ok(Action::await_change());
        }
    };

    let result = ctx.controller.reconcile(desired).await;
    publish_status(&es, &key, &ctx).await?;

    match result {
        Ok(outcome) => Ok(ctx
            .controller
            .requeue_after(outcome.phase)
            .map(Action::requeue)
            .unwrap_or_else(Action::await_change)),
        // Reported on the status; only a spec change can fix it
        Err(e) if e.is_rejection() => Ok(Action::await_change()),
        Err(e) => Err(e),
    }
}

/// Decide how to retry a failed reconcile
pub fn error_policy(es: Arc<Elasticsearch>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        cluster = %es.name(),
        error = %error,
        "Reconciliation failed"
    );
    requeue_for(error, ctx.controller.config().progressing_requeue_secs)
}

fn requeue_for(error: &Error, backoff_secs: u64) -> Action {
    match error.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(Duration::from_secs(backoff_secs)),
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// Write the cluster's record to the status subresource
async fn publish_status(es: &Elasticsearch, key: &ClusterKey, ctx: &Context) -> Result<()> {
    let Some(record) = ctx.controller.record(key) else {
        return Ok(());
    };

    let status = record.to_resource_status(es.status.as_ref());
    if unchanged(es.status.as_ref(), &status) {
        return Ok(());
    }

    let api: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &key.name,
        &PatchParams::apply(&ctx.controller.config().field_manager),
        &Patch::Merge(&patch),
    )
    .await?;

    debug!(cluster = %key, phase = %status.phase, "Status updated");
    Ok(())
}

/// Status writes trigger a new watch event, so skip writes that only move the timestamp
fn unchanged(previous: Option<&ElasticsearchStatus>, next: &ElasticsearchStatus) -> bool {
    match previous {
        Some(previous) => {
            let mut candidate = next.clone();
            candidate.last_reconcile_time = previous.last_reconcile_time;
            &candidate == previous
        }
        None => false,
    }
}

fn is_being_deleted(es: &Elasticsearch) -> bool {
    es.metadata.deletion_timestamp.is_some()
}

/// Cluster whose resource disappeared before it could be reconciled
fn released_key<E, Q>(error: &controller::Error<E, Q>) -> Option<ClusterKey>
where
    E: std::error::Error + 'static,
    Q: std::error::Error + 'static,
{
    match error {
        controller::Error::ObjectNotFound(object) => Some(ClusterKey::new(
            object.namespace.clone().unwrap_or_else(|| "default".to_string()),
            object.name.clone(),
        )),
        _ => None,
    }
}

/// Run the controller until a shutdown signal arrives.
/// Watches a single namespace when one is given.
pub async fn run(client: Client, controller: Arc<ClusterController>, namespace: Option<String>) {
    let (resources, deployments): (Api<Elasticsearch>, Api<Deployment>) = match &namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    info!(
        "Starting Elasticsearch controller in {}",
        namespace.as_deref().unwrap_or("all namespaces")
    );

    let released = controller.clone();
    let ctx = Arc::new(Context { client, controller });

    Controller::new(resources, watcher::Config::default())
        .owns(
            deployments,
            watcher::Config::default().labels(&managed_selector()),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            let released = released.clone();
            async move {
                match result {
                    Ok((object, action)) => {
                        debug!(cluster = %object.name, ?action, "Reconciliation completed");
                    }
                    Err(e) => match released_key(&e) {
                        Some(key) => {
                            debug!(cluster = %key, "Resource gone, dropping cluster state");
                            released.release(&key).await;
                        }
                        None => error!(error = %e, "Reconciliation error"),
                    },
                }
            }
        })
        .await;

    info!("Elasticsearch controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::state::ClusterRecord;
    use crate::crd::ClusterPhase;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::runtime::reflector::ObjectRef;

    #[test]
    fn test_requeue_policy() {
        let transient = Error::workload_api("list", "default/es", "timeout");
        assert_eq!(
            requeue_for(&transient, 10),
            Action::requeue(Duration::from_secs(10))
        );

        let rejected = Error::QuorumExceeded {
            cluster: "default/es".into(),
            master_count: 4,
            max_masters: 3,
        };
        assert_eq!(requeue_for(&rejected, 10), Action::await_change());
    }

    #[test]
    fn test_timestamp_only_changes_are_skipped() {
        let mut record = ClusterRecord::new(ClusterKey::new("default", "es"), 3);
        record.phase = ClusterPhase::Converged;
        record.last_pass = Some(chrono::Utc::now());
        let first = record.to_resource_status(None);

        record.last_pass = Some(chrono::Utc::now() + chrono::Duration::seconds(5));
        let second = record.to_resource_status(Some(&first));
        assert!(unchanged(Some(&first), &second));

        record.ready_workloads = 1;
        let third = record.to_resource_status(Some(&first));
        assert!(!unchanged(Some(&first), &third));
        assert!(!unchanged(None, &third));
    }

    #[test]
    fn test_deleted_resource_releases_its_cluster() {
        let gone = ObjectRef::<Elasticsearch>::new("es").within("logging").erase();
        let error: controller::Error<Error, watcher::Error> =
            controller::Error::ObjectNotFound(gone.clone());
        assert_eq!(released_key(&error), Some(ClusterKey::new("logging", "es")));

        let failed: controller::Error<Error, watcher::Error> =
            controller::Error::ReconcilerFailed(Error::Internal("boom".into()), gone);
        assert_eq!(released_key(&failed), None);
    }

    #[test]
    fn test_deletion_timestamp_marks_resource_deleted() {
        let mut es: Elasticsearch = serde_json::from_value(serde_json::json!({
            "apiVersion": "logging.openshift.io/v1alpha1",
            "kind": "Elasticsearch",
            "metadata": { "name": "es", "namespace": "logging" },
            "spec": { "nodes": [] }
        }))
        .unwrap();
        assert!(!is_being_deleted(&es));

        es.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(is_being_deleted(&es));
    }
}
