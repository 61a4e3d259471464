//! The provisioning controller
//!
//! One pass: wait for state sync, gather pending pods and pool templates,
//! prepare each pool's instance types for the active kubelet configuration,
//! run the scheduler, create the resulting claims, and nominate the existing
//! nodes that absorbed pods.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    Node, PersistentVolume, PersistentVolumeClaim, Pod,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use gantry_cloud::{overhead, CloudProvider, InstanceType, UnavailableOfferings};
use gantry_common::events::{actions, reasons, EventPublisher};
use gantry_common::metrics;
use gantry_common::crd::{NodeClaim, NodePool};
use gantry_common::resources::ResourceList;
use gantry_common::{Error, Result};
use gantry_scheduling::{pod_key, volume_topology, Requirements};
use gantry_state::Cluster;

use crate::batcher::Batcher;
use crate::scheduler::{Results, Scheduler, SchedulerInput, SchedulerOptions};
use crate::template::{order_templates, ClaimTemplate};

/// Kubernetes reads and writes the provisioner needs
///
/// Trait-seamed so tests drive the pass without an API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisionerClient: Send + Sync {
    /// Pods that are unschedulable and not yet nominated to a node
    async fn pending_pods(&self) -> Result<Vec<Pod>>;

    /// Pods bound to a node, for topology counting
    async fn scheduled_pods(&self) -> Result<Vec<Pod>>;

    /// All nodes, for the labels of scheduled pods
    async fn nodes(&self) -> Result<Vec<Node>>;

    /// All node pools
    async fn pools(&self) -> Result<Vec<NodePool>>;

    /// Synthetic pods representing each daemon set's template
    async fn daemon_set_pods(&self) -> Result<Vec<Pod>>;

    /// Volume objects for volume-topology resolution
    async fn volume_objects(
        &self,
    ) -> Result<(Vec<PersistentVolumeClaim>, Vec<PersistentVolume>, Vec<StorageClass>)>;

    /// Create a claim in the desired-state store
    async fn create_claim(&self, claim: &NodeClaim) -> Result<NodeClaim>;

    /// Replace a pool's status with its current provisioned capacity
    async fn update_pool_status(&self, pool: &str, resources: ResourceList) -> Result<()>;
}

/// Production implementation against the API server
pub struct KubeProvisionerClient {
    client: Client,
}

impl KubeProvisionerClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProvisionerClient for KubeProvisionerClient {
    async fn pending_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().fields("spec.nodeName="))
            .await?;
        Ok(pods
            .items
            .into_iter()
            .filter(is_provisionable)
            .collect())
    }

    async fn scheduled_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api.list(&ListParams::default()).await?;
        Ok(pods
            .items
            .into_iter()
            .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_ref()).is_some())
            .collect())
    }

    async fn nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn pools(&self) -> Result<Vec<NodePool>> {
        let api: Api<NodePool> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn daemon_set_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<DaemonSet> = Api::all(self.client.clone());
        let daemon_sets = api.list(&ListParams::default()).await?;
        Ok(daemon_sets
            .items
            .iter()
            .filter_map(daemon_set_pod)
            .collect())
    }

    async fn volume_objects(
        &self,
    ) -> Result<(Vec<PersistentVolumeClaim>, Vec<PersistentVolume>, Vec<StorageClass>)> {
        let pvcs: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        Ok((
            pvcs.list(&ListParams::default()).await?.items,
            pvs.list(&ListParams::default()).await?.items,
            classes.list(&ListParams::default()).await?.items,
        ))
    }

    async fn create_claim(&self, claim: &NodeClaim) -> Result<NodeClaim> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), claim).await?)
    }

    async fn update_pool_status(&self, pool: &str, resources: ResourceList) -> Result<()> {
        let api: Api<NodePool> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": { "resources": resources } });
        api.patch_status(
            pool,
            &kube::api::PatchParams::apply("gantry-provisioner"),
            &kube::api::Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// A pod counts as provisionable when the scheduler reported it
/// unschedulable and no node has been picked for it
fn is_provisionable(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
        .unwrap_or(false)
}

/// Materialize the pod a daemon set would run, for overhead accounting
fn daemon_set_pod(daemon_set: &DaemonSet) -> Option<Pod> {
    let spec = daemon_set.spec.as_ref()?;
    Some(Pod {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(format!("{}-template", daemon_set.name_any())),
            namespace: daemon_set.metadata.namespace.clone(),
            labels: spec.template.metadata.as_ref().and_then(|m| m.labels.clone()),
            ..Default::default()
        },
        spec: spec.template.spec.clone(),
        ..Default::default()
    })
}

/// The provisioning controller
pub struct Provisioner {
    client: Arc<dyn ProvisionerClient>,
    cloud: Arc<dyn CloudProvider>,
    cluster: Arc<Cluster>,
    unavailable: Arc<UnavailableOfferings>,
    events: Arc<dyn EventPublisher>,
}

impl Provisioner {
    /// Wire up a provisioner
    pub fn new(
        client: Arc<dyn ProvisionerClient>,
        cloud: Arc<dyn CloudProvider>,
        cluster: Arc<Cluster>,
        unavailable: Arc<UnavailableOfferings>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            cloud,
            cluster,
            unavailable,
            events,
        }
    }

    /// Consume batches until every trigger handle is dropped
    pub async fn run(&self, mut batcher: Batcher) {
        while batcher.wait().await.is_some() {
            if let Err(e) = self.provision().await {
                warn!(error = %e, "Provisioning pass failed");
            }
        }
        info!("Provisioner loop stopped");
    }

    /// One complete scheduling pass; returns the claims created
    pub async fn provision(&self) -> Result<usize> {
        self.cluster.synchronized().await?;

        // pods a previous pass already placed wait out their nomination
        let pods: Vec<Pod> = self
            .client
            .pending_pods()
            .await?
            .into_iter()
            .filter(|p| !self.cluster.is_pod_nominated(&pod_key(p)))
            .collect();
        if pods.is_empty() {
            return Ok(0);
        }
        info!(pods = pods.len(), "Found provisionable pods");
        let started = std::time::Instant::now();

        let pools = self.client.pools().await?;
        let mut templates: Vec<Arc<ClaimTemplate>> = Vec::new();
        let mut instance_types: BTreeMap<String, Vec<InstanceType>> = BTreeMap::new();
        let mut pool_limits: BTreeMap<String, ResourceList> = BTreeMap::new();
        for pool in &pools {
            if pool.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let name = pool.name_any();
            if let Err(e) = pool.spec.validate(&name) {
                warn!(pool = %name, error = %e, "Skipping misconfigured pool");
                continue;
            }
            let template = Arc::new(ClaimTemplate::from_pool(pool));
            let raw = self.cloud.get_instance_types(Some(pool)).await.map_err(|e| {
                Error::cloud_provider(&name, format!("listing instance types: {e}"))
            })?;
            instance_types.insert(name.clone(), self.prepare_instance_types(raw, &template));
            if let Some(limits) = &pool.spec.limits {
                pool_limits.insert(name.clone(), limits.clone());
            }
            templates.push(template);
        }
        order_templates(&mut templates);
        if templates.is_empty() {
            debug!("No usable pools; nothing to provision");
            return Ok(0);
        }

        let daemon_pods = self.client.daemon_set_pods().await?;
        let node_labels: BTreeMap<String, BTreeMap<String, String>> = self
            .client
            .nodes()
            .await?
            .into_iter()
            .map(|n| (n.name_any(), n.metadata.labels.unwrap_or_default()))
            .collect();
        let running_pods: Vec<(Pod, BTreeMap<String, String>)> = self
            .client
            .scheduled_pods()
            .await?
            .into_iter()
            .map(|pod| {
                let labels = pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_ref())
                    .and_then(|n| node_labels.get(n))
                    .cloned()
                    .unwrap_or_default();
                (pod, labels)
            })
            .collect();

        let (pvcs, pvs, classes) = self.client.volume_objects().await?;
        let mut volume_requirements: BTreeMap<String, Requirements> = BTreeMap::new();
        let mut schedulable = Vec::new();
        for pod in pods {
            match volume_topology::volume_requirements(&pod, &pvcs, &pvs, &classes) {
                Ok(requirements) => {
                    volume_requirements.insert(pod_key(&pod), requirements);
                    schedulable.push(pod);
                }
                Err(e) => {
                    // an unresolvable claim stops this pod, not the pass
                    self.publish_pod_event(
                        &pod,
                        EventType::Warning,
                        reasons::FAILED_SCHEDULING,
                        e.to_string(),
                    )
                    .await;
                }
            }
        }

        let pool_names: Vec<String> = templates.iter().map(|t| t.pool_name.clone()).collect();
        let scheduler = Scheduler::new(
            SchedulerInput {
                templates,
                instance_types,
                pool_limits,
                state_nodes: self.cluster.snapshot(),
                daemon_pods,
                running_pods,
                volume_requirements,
            },
            SchedulerOptions::default(),
        );
        let results = scheduler.solve(schedulable);
        metrics::SCHEDULING_DURATION.record(
            started.elapsed().as_secs_f64(),
            &[KeyValue::new("simulated", "false")],
        );

        let created = self.apply(results).await?;

        // pool status follows the projected view; best effort
        for pool in &pool_names {
            let capacity = self.cluster.pool_capacity(pool);
            if let Err(e) = self.client.update_pool_status(pool, capacity).await {
                warn!(pool = %pool, error = %e, "Failed to update pool status");
            }
        }
        Ok(created)
    }

    /// Create claims and nominate placements for a pass's results
    async fn apply(&self, results: Results) -> Result<usize> {
        let mut created = 0usize;
        for claim in &results.new_claims {
            let object = claim.to_node_claim();
            let stored = self.client.create_claim(&object).await?;
            metrics::CLAIMS_CREATED.add(
                1,
                &[KeyValue::new("nodepool", claim.template.pool_name.clone())],
            );
            info!(
                claim = %stored.name_any(),
                nodepool = %claim.template.pool_name,
                pods = claim.pod_count(),
                instance_types = claim.instance_types.len(),
                "Created node claim"
            );
            for pod_key in &claim.pod_keys {
                self.cluster.nominate_pod(pod_key);
            }
            created += 1;
        }

        for node in &results.existing_nodes {
            self.cluster.nominate_node(node.provider_id());
            for pod_key in &node.pod_keys {
                self.cluster.nominate_pod(pod_key);
                self.publish_pod_key_event(
                    pod_key,
                    EventType::Normal,
                    reasons::NOMINATED,
                    format!("pod should schedule to {}", node.provider_id()),
                )
                .await;
            }
            debug!(
                provider_id = %node.provider_id(),
                pods = node.pod_keys.len(),
                "Nominated existing node for pods"
            );
        }

        if !results.pod_errors.is_empty() {
            warn!(
                unschedulable = results.pod_errors.len(),
                "{}", results.pod_scheduling_errors()
            );
            metrics::UNSCHEDULABLE_PODS.add(
                results.pod_errors.len() as u64,
                &[KeyValue::new("reason", "no_fit")],
            );
            for (pod_key, reason) in &results.pod_errors {
                self.publish_pod_key_event(
                    pod_key,
                    EventType::Warning,
                    reasons::FAILED_SCHEDULING,
                    gantry_common::error::truncate_message(reason),
                )
                .await;
            }
        }
        Ok(created)
    }

    async fn publish_pod_key_event(
        &self,
        pod_key: &str,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let (namespace, name) = pod_key.split_once('/').unwrap_or(("default", pod_key));
        let reference = k8s_openapi::api::core::v1::ObjectReference {
            kind: Some("Pod".into()),
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        };
        self.events
            .publish(&reference, type_, reason, actions::PROVISION, Some(note))
            .await;
    }

    /// Apply kubelet overrides and the unavailable-offerings cache to a
    /// pool's raw catalog
    fn prepare_instance_types(
        &self,
        raw: Vec<InstanceType>,
        template: &ClaimTemplate,
    ) -> Vec<InstanceType> {
        raw.into_iter()
            .map(|mut it| {
                overhead::apply_pods_ceiling(&mut it.capacity, template.kubelet.as_ref());
                it.overhead = overhead::derive(&it.capacity, template.kubelet.as_ref());
                for offering in &mut it.offerings {
                    if self.unavailable.is_unavailable(
                        &it.name,
                        &offering.zone,
                        &offering.capacity_type,
                    ) {
                        offering.available = false;
                    }
                }
                it
            })
            .collect()
    }

    async fn publish_pod_event(
        &self,
        pod: &Pod,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let reference = k8s_openapi::api::core::v1::ObjectReference {
            kind: Some("Pod".into()),
            name: pod.metadata.name.clone(),
            namespace: pod.metadata.namespace.clone(),
            uid: pod.metadata.uid.clone(),
            ..Default::default()
        };
        self.events
            .publish(&reference, type_, reason, actions::PROVISION, Some(note))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_cloud::fake::FakeCloudProvider;
    use gantry_common::crd::{NodeClaimSpec, NodeClaimTemplateSpec, NodePoolSpec};
    use gantry_common::events::NoopEventPublisher;
    use k8s_openapi::api::core::v1::{Container, PodCondition, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pending_pod(name: &str, cpu: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                containers: vec![Container {
                    resources: Some(ResourceRequirements {
                        requests: Some([("cpu".to_string(), Quantity(cpu.into()))].into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".into(),
                    status: "False".into(),
                    reason: Some("Unschedulable".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pool(name: &str) -> NodePool {
        NodePool::new(
            name,
            NodePoolSpec {
                template: NodeClaimTemplateSpec {
                    spec: NodeClaimSpec::default(),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn synced_cluster() -> Arc<Cluster> {
        let cluster = Arc::new(Cluster::new());
        cluster.mark_nodes_listed();
        cluster.mark_claims_listed();
        cluster
    }

    fn provisioner_with(client: MockProvisionerClient) -> (Provisioner, Arc<FakeCloudProvider>) {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        let provisioner = Provisioner::new(
            Arc::new(client),
            cloud.clone(),
            synced_cluster(),
            Arc::new(UnavailableOfferings::default()),
            Arc::new(NoopEventPublisher),
        );
        (provisioner, cloud)
    }

    fn quiet_mock() -> MockProvisionerClient {
        let mut client = MockProvisionerClient::new();
        client.expect_scheduled_pods().returning(|| Ok(vec![]));
        client.expect_nodes().returning(|| Ok(vec![]));
        client.expect_daemon_set_pods().returning(|| Ok(vec![]));
        client
            .expect_volume_objects()
            .returning(|| Ok((vec![], vec![], vec![])));
        client
            .expect_update_pool_status()
            .returning(|_, _| Ok(()));
        client
    }

    #[tokio::test]
    async fn no_pending_pods_is_a_quiet_pass() {
        let mut client = MockProvisionerClient::new();
        client.expect_pending_pods().returning(|| Ok(vec![]));
        let (provisioner, _) = provisioner_with(client);
        assert_eq!(provisioner.provision().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_pods_produce_a_claim_exactly_once() {
        let mut client = quiet_mock();
        client
            .expect_pending_pods()
            .returning(|| Ok(vec![pending_pod("p1", "1"), pending_pod("p2", "1")]));
        client.expect_pools().returning(|| Ok(vec![pool("default")]));
        client
            .expect_create_claim()
            .times(1)
            .returning(|claim| {
                let mut stored = claim.clone();
                stored.metadata.name = Some("default-x7k2p".into());
                Ok(stored)
            });
        let (provisioner, _) = provisioner_with(client);
        assert_eq!(provisioner.provision().await.unwrap(), 1);

        // the pods are nominated now: an immediate re-run provisions nothing
        assert_eq!(provisioner.provision().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn misconfigured_pools_are_skipped() {
        let mut bad = pool("broken");
        bad.spec.disruption.expire_after = Some("tomorrow".into());
        let mut client = quiet_mock();
        client
            .expect_pending_pods()
            .returning(|| Ok(vec![pending_pod("p1", "1")]));
        client
            .expect_pools()
            .returning(move || Ok(vec![bad.clone()]));
        let (provisioner, _) = provisioner_with(client);
        // the only pool is unusable: the pass completes without claims
        assert_eq!(provisioner.provision().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unresolvable_volume_claim_sidelines_the_pod() {
        let mut client = quiet_mock();
        client.expect_pending_pods().returning(|| {
            let mut pod = pending_pod("db-0", "1");
            pod.spec.as_mut().unwrap().volumes =
                Some(vec![k8s_openapi::api::core::v1::Volume {
                    name: "data".into(),
                    persistent_volume_claim: Some(
                        k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                            claim_name: "missing".into(),
                            ..Default::default()
                        },
                    ),
                    ..Default::default()
                }]);
            Ok(vec![pod])
        });
        client.expect_pools().returning(|| Ok(vec![pool("default")]));
        client.expect_create_claim().never();
        let (provisioner, _) = provisioner_with(client);
        assert_eq!(provisioner.provision().await.unwrap(), 0);
    }
}
