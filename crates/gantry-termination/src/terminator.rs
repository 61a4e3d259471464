//! Cordon and drain
//!
//! Cordoning sets the unschedulable bit and the load-balancer exclusion
//! label. Draining evicts workload pods in two passes: everything ordinary
//! first, cluster- and node-critical pods only once nothing else remains.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use gantry_common::{Result, CRITICAL_PRIORITY_CLASSES, EXCLUDE_FROM_LB_LABEL, UNSCHEDULABLE_TAINT_KEY};
use gantry_state::{is_daemon_pod, is_static_pod};

use crate::eviction::EvictionQueue;

/// Node reads and writes used during termination
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TerminationClient: Send + Sync {
    /// The node by name, if it still exists
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Merge-patch a node
    async fn patch_node(&self, name: &str, patch: serde_json::Value) -> Result<()>;

    /// Pods bound to the node
    async fn pods_on_node(&self, name: &str) -> Result<Vec<Pod>>;

    /// Delete the node object; success on not-found
    async fn delete_node(&self, name: &str) -> Result<()>;
}

/// Production implementation
pub struct KubeTerminationClient {
    client: Client,
}

impl KubeTerminationClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TerminationClient for KubeTerminationClient {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(node) => Ok(Some(node)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_node(&self, name: &str, patch: serde_json::Value) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(
            name,
            &PatchParams::apply("gantry-termination"),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn pods_on_node(&self, name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().fields(&format!("spec.nodeName={name}")))
            .await?;
        Ok(pods.items)
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Drives one node from cordoned to empty
pub struct Terminator {
    client: Arc<dyn TerminationClient>,
    evictions: Arc<EvictionQueue>,
}

/// Where a drain pass left the node
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DrainStatus {
    /// Workload pods remain; call again
    Draining,
    /// No evictable workload pods remain
    Drained,
}

impl Terminator {
    /// Wire up the terminator
    pub fn new(client: Arc<dyn TerminationClient>, evictions: Arc<EvictionQueue>) -> Self {
        Self { client, evictions }
    }

    /// Set the unschedulable bit and the LB exclusion label, once
    pub async fn cordon(&self, node: &Node) -> Result<()> {
        let already_cordoned = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
            && node
                .metadata
                .labels
                .as_ref()
                .map(|l| l.contains_key(EXCLUDE_FROM_LB_LABEL))
                .unwrap_or(false);
        if already_cordoned {
            return Ok(());
        }
        info!(node = %node.name_any(), "Cordoning node");
        self.client
            .patch_node(
                &node.name_any(),
                json!({
                    "metadata": { "labels": { EXCLUDE_FROM_LB_LABEL: "true" } },
                    "spec": { "unschedulable": true },
                }),
            )
            .await
    }

    /// One drain pass over the node's pods
    pub async fn drain(&self, node_name: &str) -> Result<DrainStatus> {
        let pods = self.client.pods_on_node(node_name).await?;
        let evictable: Vec<&Pod> = pods.iter().filter(|p| is_evictable(p)).collect();
        if evictable.is_empty() {
            self.evictions.clear_node(node_name, &[]);
            return Ok(DrainStatus::Drained);
        }

        // ordinary pods first; critical pods only once the rest are gone
        let (critical, ordinary): (Vec<&Pod>, Vec<&Pod>) =
            evictable.into_iter().partition(|p| is_critical(p));
        let batch = if ordinary.is_empty() { critical } else { ordinary };
        debug!(
            node = %node_name,
            pods = batch.len(),
            "Draining pods"
        );
        self.evictions.evict_pods(node_name, &batch).await;
        Ok(DrainStatus::Draining)
    }

    /// Delete the node object once its instance is gone
    pub async fn finish(&self, node_name: &str) -> Result<()> {
        self.client.delete_node(node_name).await
    }
}

/// Pods the drain must evict
///
/// Daemon pods, static/mirror pods, pods tolerating the unschedulable taint
/// and pods already terminating are skipped.
fn is_evictable(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    if is_daemon_pod(pod) || is_static_pod(pod) {
        return false;
    }
    let tolerates_unschedulable = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.as_ref())
        .map(|tolerations| {
            tolerations.iter().any(|t| {
                t.key.as_deref() == Some(UNSCHEDULABLE_TAINT_KEY)
                    || (t.operator.as_deref() == Some("Exists") && t.key.is_none())
            })
        })
        .unwrap_or(false);
    !tolerates_unschedulable
}

/// Pods drained in the final pass
fn is_critical(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.priority_class_name.as_deref())
        .map(|pc| CRITICAL_PRIORITY_CLASSES.contains(&pc))
        .unwrap_or(false)
}

/// True when the node carries no pods the drain is responsible for
pub fn drain_complete(pods: &[Pod]) -> bool {
    pods.iter().all(|p| !is_evictable(p))
}
