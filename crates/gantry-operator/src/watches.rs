//! Watch streams feeding the cluster state projection
//!
//! Each stream applies events to the shared [`Cluster`] and, for pods,
//! nudges the batcher when an unschedulable pod appears. Initial-list
//! completion flips the projection's sync flags; the provisioner and
//! planner block on them.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::Api;
use kube::runtime::watcher::{self, watcher, Event};
use kube::ResourceExt;
use tracing::warn;

use gantry_common::crd::NodeClaim;
use gantry_provisioner::BatchHandle;
use gantry_scheduling::pod_key;
use gantry_state::Cluster;

const WATCH_RESTART_DELAY: Duration = Duration::from_secs(2);

/// True for pods the provisioner should wake up for
fn is_unschedulable(pod: &Pod) -> bool {
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

/// Watch pods: track scheduled pods, trigger on unschedulable ones
pub async fn watch_pods(api: Api<Pod>, cluster: Arc<Cluster>, batch: BatchHandle) {
    loop {
        let mut stream = Box::pin(watcher(api.clone(), watcher::Config::default()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                    cluster.update_pod(&pod);
                    if is_unschedulable(&pod) {
                        batch.trigger();
                    }
                }
                Ok(Event::Delete(pod)) => {
                    cluster.delete_pod(&pod_key(&pod));
                    batch.trigger();
                }
                Ok(Event::Init) | Ok(Event::InitDone) => {}
                Err(e) => {
                    warn!(error = %e, "Pod watch error; restarting");
                    break;
                }
            }
        }
        tokio::time::sleep(WATCH_RESTART_DELAY).await;
    }
}

/// Watch nodes into the projection
pub async fn watch_nodes(api: Api<Node>, cluster: Arc<Cluster>) {
    loop {
        let mut stream = Box::pin(watcher(api.clone(), watcher::Config::default()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(node)) | Ok(Event::InitApply(node)) => {
                    cluster.update_node(&node);
                }
                Ok(Event::Delete(node)) => {
                    if let Some(provider_id) =
                        node.spec.as_ref().and_then(|s| s.provider_id.as_deref())
                    {
                        cluster.delete_node(provider_id);
                    }
                }
                Ok(Event::Init) => {}
                Ok(Event::InitDone) => cluster.mark_nodes_listed(),
                Err(e) => {
                    warn!(error = %e, "Node watch error; restarting");
                    break;
                }
            }
        }
        tokio::time::sleep(WATCH_RESTART_DELAY).await;
    }
}

/// Watch claims into the projection
pub async fn watch_claims(api: Api<NodeClaim>, cluster: Arc<Cluster>) {
    loop {
        let mut stream = Box::pin(watcher(api.clone(), watcher::Config::default()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(claim)) | Ok(Event::InitApply(claim)) => {
                    cluster.update_claim(&claim);
                }
                Ok(Event::Delete(claim)) => {
                    cluster.delete_claim(&claim.name_any());
                }
                Ok(Event::Init) => {}
                Ok(Event::InitDone) => cluster.mark_claims_listed(),
                Err(e) => {
                    warn!(error = %e, "Claim watch error; restarting");
                    break;
                }
            }
        }
        tokio::time::sleep(WATCH_RESTART_DELAY).await;
    }
}
