//! Kubernetes Workload Backend
//!
//! Runs each Elasticsearch node as a single-replica Deployment labelled with
//! its slot. Persistent groups get one PersistentVolumeClaim per workload,
//! named after it; claims outlive their Deployment.

use crate::crd::ElasticsearchNodeSpec;
use crate::domain::ports::{ObservedState, ObservedWorkload, WorkloadApi, WorkloadTemplate};
use crate::error::{Error, Result};
use crate::topology::{cluster_selector, ClusterKey, NodeRole, StorageSource, WorkloadIdentity};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const STORAGE_VOLUME: &str = "elasticsearch-storage";
const STORAGE_PATH: &str = "/elasticsearch/persistent";
const SECRET_VOLUME: &str = "certificates";
const SECRET_PATH: &str = "/etc/elasticsearch/secret";
const HTTP_PORT: i32 = 9200;
const TRANSPORT_PORT: i32 = 9300;

/// Annotation carrying the template revision a Deployment was written with
pub const ANNOTATION_REVISION: &str = "logging.openshift.io/template-revision";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Kubernetes backend
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// Image used when a node group does not name one
    pub default_image: String,
    /// Field manager recorded on writes
    pub field_manager: String,
    /// Give up retrying a list after this long
    pub list_retry_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            default_image: "docker.elastic.co/elasticsearch/elasticsearch:6.8.23".to_string(),
            field_manager: "elasticsearch-operator".to_string(),
            list_retry_secs: 30,
        }
    }
}

// =============================================================================
// Kubernetes Workloads
// =============================================================================

/// Workload API backed by Deployments
pub struct KubernetesWorkloads {
    client: Client,
    config: KubernetesConfig,
}

impl KubernetesWorkloads {
    pub fn new(client: Client, config: KubernetesConfig) -> Self {
        Self { client, config }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn ensure_claim(&self, identity: &WorkloadIdentity, template: &WorkloadTemplate) -> Result<()> {
        let Some(claim) = build_claim(identity, template) else {
            return Ok(());
        };
        let name = identity.name();
        let pp = PostParams {
            field_manager: Some(self.config.field_manager.clone()),
            ..Default::default()
        };
        match self.claims(&identity.cluster.namespace).create(&pp, &claim).await {
            Ok(_) => {
                info!("Created volume claim {}", name);
                Ok(())
            }
            // Claims are retained across workload deletions
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("Volume claim {} already exists", name);
                Ok(())
            }
            Err(e) => Err(Error::workload_api("create", name, e)),
        }
    }
}

#[async_trait]
impl WorkloadApi for KubernetesWorkloads {
    async fn create(&self, identity: &WorkloadIdentity, template: &WorkloadTemplate) -> Result<()> {
        self.ensure_claim(identity, template).await?;

        let name = identity.name();
        let deployment = build_deployment(identity, template, &self.config.default_image);
        let pp = PostParams {
            field_manager: Some(self.config.field_manager.clone()),
            ..Default::default()
        };

        match self
            .deployments(&identity.cluster.namespace)
            .create(&pp, &deployment)
            .await
        {
            Ok(_) => {
                info!("Created deployment {}", name);
                Ok(())
            }
            Err(e) => Err(Error::workload_api("create", name, e)),
        }
    }

    async fn update(&self, identity: &WorkloadIdentity, replicas: i32) -> Result<()> {
        let name = identity.name();
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        let pp = PatchParams {
            field_manager: Some(self.config.field_manager.clone()),
            ..Default::default()
        };

        self.deployments(&identity.cluster.namespace)
            .patch(&name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::workload_api("update", name.clone(), e))?;

        info!("Scaled deployment {} to {} replicas", name, replicas);
        Ok(())
    }

    async fn replace(&self, identity: &WorkloadIdentity, template: &WorkloadTemplate) -> Result<()> {
        self.ensure_claim(identity, template).await?;

        let name = identity.name();
        let deployment = build_deployment(identity, template, &self.config.default_image);
        let pp = PatchParams::apply(&self.config.field_manager).force();

        self.deployments(&identity.cluster.namespace)
            .patch(&name, &pp, &Patch::Apply(&deployment))
            .await
            .map_err(|e| Error::workload_api("replace", name.clone(), e))?;

        info!("Rolled deployment {} onto template {}", name, template.revision());
        Ok(())
    }

    async fn delete(&self, identity: &WorkloadIdentity) -> Result<()> {
        let name = identity.name();

        match self
            .deployments(&identity.cluster.namespace)
            .delete(&name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!("Deleted deployment {}", name);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("Deployment {} already gone", name);
                Ok(())
            }
            Err(e) => Err(Error::workload_api("delete", name, e)),
        }
    }

    async fn list(&self, cluster: &ClusterKey) -> Result<ObservedState> {
        let api = self.deployments(&cluster.namespace);
        let lp = ListParams::default().labels(&cluster_selector(cluster));
        let policy = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::from_secs(self.config.list_retry_secs)))
            .build();

        let deployments = backoff::future::retry(policy, || {
            let api = api.clone();
            let lp = lp.clone();
            async move {
                api.list(&lp).await.map_err(|e| match &e {
                    kube::Error::Api(ae) if ae.code == 403 || ae.code == 404 => {
                        backoff::Error::permanent(e)
                    }
                    _ => {
                        warn!("Listing deployments failed, retrying: {}", e);
                        backoff::Error::transient(e)
                    }
                })
            }
        })
        .await
        .map_err(|e| Error::workload_api("list", cluster.to_string(), e))?;

        Ok(deployments
            .items
            .iter()
            .filter_map(|d| observe(&cluster.namespace, d))
            .filter(|w| &w.identity.cluster == cluster)
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.apiserver_version().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("API server unreachable: {}", e);
                Ok(false)
            }
        }
    }

    fn backend_name(&self) -> &str {
        "kubernetes"
    }
}

// =============================================================================
// Object Builders
// =============================================================================

/// Observed view of a Deployment we manage
fn observe(namespace: &str, deployment: &Deployment) -> Option<ObservedWorkload> {
    let labels = deployment.metadata.labels.as_ref()?;
    let identity = WorkloadIdentity::from_labels(namespace, labels)?;

    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready_replicas = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let revision = deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_REVISION))
        .cloned();

    Some(ObservedWorkload {
        identity,
        replicas,
        ready_replicas,
        revision,
    })
}

fn owner_references(template: &WorkloadTemplate) -> Option<Vec<OwnerReference>> {
    template.owner.as_ref().map(|owner| {
        vec![OwnerReference {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    })
}

fn resources(node_spec: &ElasticsearchNodeSpec) -> Option<ResourceRequirements> {
    let mut quantities = BTreeMap::new();
    if let Some(cpu) = &node_spec.cpu {
        quantities.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &node_spec.memory {
        quantities.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if quantities.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        ..Default::default()
    })
}

fn env(identity: &WorkloadIdentity, template: &WorkloadTemplate) -> Vec<EnvVar> {
    let var = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    };
    vec![
        var("CLUSTER_NAME", identity.cluster.name.clone()),
        var("NODE_ROLES", template.roles.to_csv()),
        var(
            "IS_MASTER",
            template.roles.contains(NodeRole::Master).to_string(),
        ),
        var("HAS_DATA", template.roles.contains(NodeRole::Data).to_string()),
    ]
}

fn storage_volume(identity: &WorkloadIdentity, storage: &StorageSource) -> Volume {
    match storage {
        StorageSource::Ephemeral { medium, size_limit } => Volume {
            name: STORAGE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: medium.clone(),
                size_limit: size_limit.clone().map(Quantity),
            }),
            ..Default::default()
        },
        StorageSource::PersistentVolumeClaim { .. } => Volume {
            name: STORAGE_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: identity.name(),
                read_only: Some(false),
            }),
            ..Default::default()
        },
    }
}

/// Deployment running the node of one slot
pub fn build_deployment(
    identity: &WorkloadIdentity,
    template: &WorkloadTemplate,
    default_image: &str,
) -> Deployment {
    let labels = identity.labels();
    let image = template
        .node_spec
        .image
        .clone()
        .unwrap_or_else(|| default_image.to_string());

    let mut volumes = vec![storage_volume(identity, &template.storage)];
    let mut mounts = vec![VolumeMount {
        name: STORAGE_VOLUME.to_string(),
        mount_path: STORAGE_PATH.to_string(),
        ..Default::default()
    }];
    if !template.secret_name.is_empty() {
        volumes.push(Volume {
            name: SECRET_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(template.secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: SECRET_VOLUME.to_string(),
            mount_path: SECRET_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let container = Container {
        name: "elasticsearch".to_string(),
        image: Some(image),
        env: Some(env(identity, template)),
        ports: Some(vec![
            ContainerPort {
                name: Some("http".to_string()),
                container_port: HTTP_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("cluster".to_string()),
                container_port: TRANSPORT_PORT,
                ..Default::default()
            },
        ]),
        resources: resources(&template.node_spec),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(identity.name()),
            namespace: Some(identity.cluster.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_REVISION.to_string(),
                template.revision(),
            )])),
            owner_references: owner_references(template),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(template.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            // A node must release its volume before its successor starts
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volume claim for a persistent slot, None for ephemeral storage
pub fn build_claim(identity: &WorkloadIdentity, template: &WorkloadTemplate) -> Option<PersistentVolumeClaim> {
    let StorageSource::PersistentVolumeClaim {
        storage_class_name,
        size,
    } = &template.storage
    else {
        return None;
    };

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size.clone()));

    Some(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(identity.name()),
            namespace: Some(identity.cluster.namespace.clone()),
            labels: Some(identity.labels()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{identify, ClusterSpec, NodeGroup, OwnerRef, RoleSet};
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    fn fixture(storage: StorageSource) -> (WorkloadIdentity, WorkloadTemplate) {
        let key = ClusterKey::new("logging", "example-elasticsearch");
        let roles = RoleSet::from_roles([NodeRole::Data, NodeRole::Master]);
        let mut spec = ClusterSpec::new(key.clone());
        spec.secret_name = "es-certs".to_string();
        spec.owner = Some(OwnerRef {
            api_version: "logging.openshift.io/v1alpha1".to_string(),
            kind: "Elasticsearch".to_string(),
            name: "example-elasticsearch".to_string(),
            uid: "1234".to_string(),
        });
        let group = NodeGroup::new(roles, 1).with_storage(storage);
        (
            identify(&key, 0, 1, roles),
            WorkloadTemplate::for_group(&spec, &group),
        )
    }

    #[test]
    fn test_deployment_carries_slot_identity() {
        let (identity, template) = fixture(StorageSource::default());
        let deployment = build_deployment(&identity, &template, "es:latest");

        assert_eq!(
            deployment.metadata.name.as_deref(),
            Some("example-elasticsearch-datamaster-0-1")
        );
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("logging"));
        let owners = deployment.metadata.owner_references.clone().unwrap();
        assert_eq!(owners[0].kind, "Elasticsearch");
        assert_eq!(owners[0].controller, Some(true));

        let spec = deployment.spec.clone().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("es:latest"));

        let env = container.env.clone().unwrap();
        let value = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
                .unwrap()
        };
        assert_eq!(value("NODE_ROLES"), "data,master");
        assert_eq!(value("IS_MASTER"), "true");
        assert_eq!(value("HAS_DATA"), "true");

        let volumes = pod.volumes.unwrap();
        assert!(volumes[0].empty_dir.is_some());
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("es-certs")
        );
    }

    #[test]
    fn test_persistent_storage_uses_named_claim() {
        let (identity, template) = fixture(StorageSource::PersistentVolumeClaim {
            storage_class_name: Some("fast".to_string()),
            size: "50Gi".to_string(),
        });

        let claim = build_claim(&identity, &template).unwrap();
        assert_eq!(claim.metadata.name, Some(identity.name()));
        let spec = claim.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));

        let deployment = build_deployment(&identity, &template, "es:latest");
        let volumes = deployment.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        let source = volumes[0].persistent_volume_claim.as_ref().unwrap();
        assert_eq!(source.claim_name, identity.name());
    }

    #[test]
    fn test_ephemeral_storage_has_no_claim() {
        let (identity, template) = fixture(StorageSource::default());
        assert!(build_claim(&identity, &template).is_none());
    }

    #[test]
    fn test_observe_reads_labels_and_readiness() {
        let (identity, template) = fixture(StorageSource::default());
        let mut deployment = build_deployment(&identity, &template, "es:latest");
        deployment.status = Some(DeploymentStatus {
            ready_replicas: Some(1),
            ..Default::default()
        });

        let observed = observe("logging", &deployment).unwrap();
        assert_eq!(observed.identity, identity);
        assert!(observed.is_ready());
        assert_eq!(observed.revision, Some(template.revision()));

        // Deployments written before revisions were stamped read as drifted
        deployment.metadata.annotations = None;
        assert_eq!(observe("logging", &deployment).unwrap().revision, None);

        deployment.metadata.labels = Some(BTreeMap::new());
        assert!(observe("logging", &deployment).is_none());
    }
}
