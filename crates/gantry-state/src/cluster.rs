//! The cluster state projection
//!
//! An in-memory, provider-id-indexed view of nodes and claims fed by watch
//! events. Writers serialize through one lock; readers take deep snapshots
//! so a scheduling pass never observes a half-applied event.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use gantry_common::crd::NodeClaim;
use gantry_common::resources::{self, ResourceList};
use gantry_common::{Error, Result, INITIALIZED_LABEL};

use crate::node::StateNode;

/// How long a nomination protects a node from double-counting
pub const NOMINATION_TTL: Duration = Duration::from_secs(20);

#[derive(Clone)]
struct PodRecord {
    provider_id: String,
    pod: Pod,
    is_daemon: bool,
}

#[derive(Default)]
struct Inner {
    /// Nodes and in-flight claims by provider-id
    nodes: BTreeMap<String, StateNode>,
    /// Registered node name → provider-id
    node_names: BTreeMap<String, String>,
    /// Claim name → provider-id
    claims: BTreeMap<String, String>,
    /// Pod key → its tracked contribution
    pods: BTreeMap<String, PodRecord>,
    /// Pods recently placed by a scheduling pass, with nomination expiry
    nominated_pods: BTreeMap<String, Instant>,
    nodes_listed: bool,
    claims_listed: bool,
}

/// The shared cluster state
pub struct Cluster {
    inner: std::sync::RwLock<Inner>,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    /// An empty projection
    pub fn new() -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        Self {
            inner: std::sync::RwLock::new(Inner::default()),
            synced_tx,
            synced_rx,
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("cluster state lock poisoned")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("cluster state lock poisoned")
    }

    /// Apply a node create/update event
    pub fn update_node(&self, node: &Node) {
        let Some(provider_id) = node.spec.as_ref().and_then(|s| s.provider_id.clone()) else {
            // nodes without a provider-id cannot be correlated; skip them
            return;
        };
        let name = node.name_any();
        let mut inner = self.write();

        if let Some(previous) = inner.node_names.insert(name.clone(), provider_id.clone()) {
            if previous != provider_id {
                inner.detach_node(&previous, &name);
            }
        }

        let entry = inner
            .nodes
            .entry(provider_id.clone())
            .or_insert_with(|| StateNode::from_claim(provider_id.clone()));
        entry.node_names.insert(name.clone());
        if entry.node_names.len() > 1 {
            warn!(
                provider_id,
                nodes = ?entry.node_names,
                "Multiple nodes share one provider-id"
            );
        }
        entry.labels.extend(
            node.metadata
                .labels
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if let Some(taints) = node.spec.as_ref().and_then(|s| s.taints.clone()) {
            entry.taints = taints;
        }
        if let Some(status) = &node.status {
            if let Some(capacity) = &status.capacity {
                entry.capacity = capacity.clone();
            }
            if let Some(allocatable) = &status.allocatable {
                entry.allocatable = allocatable.clone();
            }
        }
        entry.initialized =
            entry.labels.get(INITIALIZED_LABEL).map(String::as_str) == Some("true");
        entry.marked_for_deletion =
            entry.marked_for_deletion || node.metadata.deletion_timestamp.is_some();
        self.notify_sync_state(&inner);
    }

    /// Remove a node from the projection
    ///
    /// The entry survives as claim-backed capacity while its claim exists.
    pub fn delete_node(&self, provider_id: &str) {
        let mut inner = self.write();
        let names: Vec<String> = inner
            .nodes
            .get(provider_id)
            .map(|n| n.node_names.iter().cloned().collect())
            .unwrap_or_default();
        for name in names {
            inner.node_names.remove(&name);
            inner.detach_node(provider_id, &name);
        }
        let has_claim = inner
            .nodes
            .get(provider_id)
            .and_then(|n| n.claim_name.clone())
            .is_some();
        if !has_claim {
            inner.nodes.remove(provider_id);
        }
    }

    /// Apply a claim create/update event
    pub fn update_claim(&self, claim: &NodeClaim) {
        let name = claim.name_any();
        let Some(provider_id) = claim.provider_id().map(String::from) else {
            // not launched yet; nothing to project
            return;
        };
        let mut inner = self.write();
        inner.claims.insert(name.clone(), provider_id.clone());
        let entry = inner
            .nodes
            .entry(provider_id.clone())
            .or_insert_with(|| StateNode::from_claim(provider_id.clone()));
        entry.claim_name = Some(name);
        for (k, v) in claim.labels() {
            entry.labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if entry.node_names.is_empty() {
            // claim-backed capacity until the node registers
            if let Some(status) = &claim.status {
                if entry.capacity.is_empty() {
                    entry.capacity = status.capacity.clone();
                }
                if entry.allocatable.is_empty() {
                    entry.allocatable = status.allocatable.clone();
                }
            }
            entry.taints = gantry_scheduling::taints::from_specs(
                claim.spec.taints.iter().chain(&claim.spec.startup_taints),
            );
        }
        entry.marked_for_deletion = entry.marked_for_deletion || claim.is_terminating();
        self.notify_sync_state(&inner);
    }

    /// Remove a claim; claim-backed entries disappear with it
    pub fn delete_claim(&self, claim_name: &str) {
        let mut inner = self.write();
        let Some(provider_id) = inner.claims.remove(claim_name) else {
            return;
        };
        let remove_entry = match inner.nodes.get_mut(&provider_id) {
            Some(node) => {
                node.claim_name = None;
                node.node_names.is_empty()
            }
            None => false,
        };
        if remove_entry {
            inner.nodes.remove(&provider_id);
        }
    }

    /// Apply a pod create/update event
    pub fn update_pod(&self, pod: &Pod) {
        let key = gantry_scheduling::pod_key(pod);
        let mut inner = self.write();
        if let Some(previous) = inner.pods.remove(&key) {
            if let Some(node) = inner.nodes.get_mut(&previous.provider_id) {
                node.remove_pod(&key, &previous.pod, previous.is_daemon);
            }
        }
        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
            return;
        };
        let Some(provider_id) = inner.node_names.get(&node_name).cloned() else {
            debug!(node = %node_name, pod = %key, "Pod on unknown node");
            return;
        };
        let is_daemon = is_daemon_pod(pod);
        if let Some(node) = inner.nodes.get_mut(&provider_id) {
            node.add_pod(&key, pod, is_daemon);
        }
        inner.pods.insert(
            key,
            PodRecord {
                provider_id,
                pod: pod.clone(),
                is_daemon,
            },
        );
    }

    /// Remove a pod's contribution
    pub fn delete_pod(&self, pod_key: &str) {
        let mut inner = self.write();
        if let Some(record) = inner.pods.remove(pod_key) {
            if let Some(node) = inner.nodes.get_mut(&record.provider_id) {
                node.remove_pod(pod_key, &record.pod, record.is_daemon);
            }
        }
    }

    /// Visit every node under the read lock
    pub fn for_each_node(&self, mut f: impl FnMut(&StateNode)) {
        let inner = self.read();
        for node in inner.nodes.values() {
            f(node);
        }
    }

    /// Deep snapshot for a scheduling pass
    pub fn snapshot(&self) -> Vec<StateNode> {
        let inner = self.read();
        inner.nodes.values().cloned().collect()
    }

    /// Deep snapshot of one node
    pub fn node(&self, provider_id: &str) -> Option<StateNode> {
        self.read().nodes.get(provider_id).cloned()
    }

    /// Mark a node as expecting a pod for [`NOMINATION_TTL`]
    pub fn nominate_node(&self, provider_id: &str) {
        let mut inner = self.write();
        if let Some(node) = inner.nodes.get_mut(provider_id) {
            node.nominated_until = Some(Instant::now() + NOMINATION_TTL);
        }
    }

    /// Mark a pod as placed by a scheduling pass for [`NOMINATION_TTL`]
    ///
    /// A nominated pod is skipped by subsequent passes so in-flight capacity
    /// is not provisioned twice while the kube-scheduler catches up.
    pub fn nominate_pod(&self, pod_key: &str) {
        let mut inner = self.write();
        inner
            .nominated_pods
            .insert(pod_key.to_string(), Instant::now() + NOMINATION_TTL);
    }

    /// True while the pod's nomination is outstanding
    pub fn is_pod_nominated(&self, pod_key: &str) -> bool {
        let now = Instant::now();
        let expired = {
            let inner = self.read();
            match inner.nominated_pods.get(pod_key) {
                Some(expiry) if *expiry > now => return true,
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.write().nominated_pods.remove(pod_key);
        }
        false
    }

    /// Claims that matched more than one node, by provider-id
    pub fn duplicate_matches(&self) -> Vec<(String, Vec<String>)> {
        let inner = self.read();
        inner
            .nodes
            .values()
            .filter(|n| n.node_names.len() > 1)
            .map(|n| {
                (
                    n.provider_id.clone(),
                    n.node_names.iter().cloned().collect(),
                )
            })
            .collect()
    }

    /// Cumulative capacity of owned nodes in a pool
    ///
    /// Recomputed from state each scheduling cycle so pool limits follow the
    /// live view rather than a status field.
    pub fn pool_capacity(&self, pool_name: &str) -> ResourceList {
        let inner = self.read();
        let mut total = ResourceList::new();
        for node in inner.nodes.values() {
            if node.pool_name() == Some(pool_name) {
                total = resources::add(&total, &node.capacity);
            }
        }
        total
    }

    /// Record that the initial node list completed
    pub fn mark_nodes_listed(&self) {
        let mut inner = self.write();
        inner.nodes_listed = true;
        self.notify_sync_state(&inner);
    }

    /// Record that the initial claim list completed
    pub fn mark_claims_listed(&self) {
        let mut inner = self.write();
        inner.claims_listed = true;
        self.notify_sync_state(&inner);
    }

    fn notify_sync_state(&self, inner: &Inner) {
        let synced = inner.nodes_listed
            && inner.claims_listed
            && inner
                .claims
                .values()
                .all(|provider_id| inner.nodes.contains_key(provider_id));
        // only ever flips false → true; a lagging watch never un-syncs
        if synced && !*self.synced_rx.borrow() {
            let _ = self.synced_tx.send(true);
        }
    }

    /// Wait until the projection is safe to schedule against
    ///
    /// Resolves once the initial lists for nodes and claims have been seen
    /// and every launched claim has a projected entry.
    pub async fn synchronized(&self) -> Result<()> {
        let mut rx = self.synced_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            rx.changed()
                .await
                .map_err(|_| Error::state("sync", "state watch closed"))?;
        }
    }

    /// True when the projection is currently synchronized
    pub fn is_synchronized(&self) -> bool {
        *self.synced_rx.borrow()
    }
}

impl Inner {
    fn detach_node(&mut self, provider_id: &str, node_name: &str) {
        if let Some(node) = self.nodes.get_mut(provider_id) {
            node.node_names.remove(node_name);
        }
    }
}

/// True for pods owned by a DaemonSet
pub fn is_daemon_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.kind == "DaemonSet")
}

/// True for static (mirror) pods, which cannot be evicted
pub fn is_static_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key("kubernetes.io/config.mirror"))
        .unwrap_or(false)
        || pod
            .metadata
            .owner_references
            .iter()
            .flatten()
            .any(|o| o.kind == "Node")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_common::crd::{NodeClaimSpec, NodeClaimStatus};
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus, PodSpec};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn claim(name: &str, provider_id: &str) -> NodeClaim {
        let mut c = NodeClaim::new(name, NodeClaimSpec::default());
        c.labels_mut()
            .insert(gantry_common::NODEPOOL_LABEL.to_string(), "default".into());
        c.status = Some(NodeClaimStatus {
            provider_id: Some(provider_id.to_string()),
            capacity: [("cpu".to_string(), Quantity("4".into()))].into(),
            allocatable: [("cpu".to_string(), Quantity("3820m".into()))].into(),
            ..Default::default()
        });
        c
    }

    fn node(name: &str, provider_id: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(
                    [(gantry_common::NODEPOOL_LABEL.to_string(), "default".to_string())].into(),
                ),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id.into()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                capacity: Some([("cpu".to_string(), Quantity("4".into()))].into()),
                allocatable: Some([("cpu".to_string(), Quantity("3900m".into()))].into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_on(name: &str, node_name: &str, daemon: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                owner_references: daemon.then(|| {
                    vec![OwnerReference {
                        kind: "DaemonSet".into(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node_name.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn claim_then_node_share_one_entry() {
        let cluster = Cluster::new();
        cluster.update_claim(&claim("default-x7k2p", "fake:///zone-a/n1"));

        // claim-backed capacity is visible before the node registers
        let snapshot = cluster.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].node_names.is_empty());
        assert_eq!(resources::millis(&snapshot[0].allocatable["cpu"]), 3_820);
        assert!(snapshot[0].owned());

        cluster.update_node(&node("node-1", "fake:///zone-a/n1"));
        let snapshot = cluster.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].node_name(), Some("node-1"));
        // node-reported allocatable replaces the claim's guess
        assert_eq!(resources::millis(&snapshot[0].allocatable["cpu"]), 3_900);
    }

    #[test]
    fn duplicate_nodes_are_surfaced_not_merged() {
        let cluster = Cluster::new();
        cluster.update_node(&node("node-1", "fake:///zone-a/n1"));
        cluster.update_node(&node("node-2", "fake:///zone-a/n1"));
        let duplicates = cluster.duplicate_matches();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].1.len(), 2);
    }

    #[test]
    fn pods_adjust_node_accounting() {
        let cluster = Cluster::new();
        cluster.update_node(&node("node-1", "fake:///zone-a/n1"));
        cluster.update_pod(&pod_on("daemon-1", "node-1", true));
        cluster.update_pod(&pod_on("app-1", "node-1", false));

        let state = cluster.node("fake:///zone-a/n1").unwrap();
        // requests are zero-valued in these pods; presence is what matters
        assert_eq!(state.node_names.len(), 1);

        cluster.delete_pod("default/app-1");
        cluster.delete_node("fake:///zone-a/n1");
        assert!(cluster.node("fake:///zone-a/n1").is_none());
    }

    #[test]
    fn delete_node_keeps_claim_backed_entry() {
        let cluster = Cluster::new();
        cluster.update_claim(&claim("default-x7k2p", "fake:///zone-a/n1"));
        cluster.update_node(&node("node-1", "fake:///zone-a/n1"));
        cluster.delete_node("fake:///zone-a/n1");
        // the claim still exists, so the capacity stays projected
        assert!(cluster.node("fake:///zone-a/n1").is_some());

        cluster.delete_claim("default-x7k2p");
        assert!(cluster.node("fake:///zone-a/n1").is_none());
    }

    #[test]
    fn nomination_expires() {
        let cluster = Cluster::new();
        cluster.update_node(&node("node-1", "fake:///zone-a/n1"));
        cluster.nominate_node("fake:///zone-a/n1");
        assert!(cluster.node("fake:///zone-a/n1").unwrap().is_nominated());
    }

    #[test]
    fn pod_nominations_are_tracked_per_key() {
        let cluster = Cluster::new();
        assert!(!cluster.is_pod_nominated("default/web-0"));
        cluster.nominate_pod("default/web-0");
        assert!(cluster.is_pod_nominated("default/web-0"));
        assert!(!cluster.is_pod_nominated("default/web-1"));
    }

    #[test]
    fn pool_capacity_sums_owned_nodes() {
        let cluster = Cluster::new();
        cluster.update_node(&node("node-1", "fake:///zone-a/n1"));
        cluster.update_node(&node("node-2", "fake:///zone-b/n2"));
        let capacity = cluster.pool_capacity("default");
        assert_eq!(resources::millis(&capacity["cpu"]), 8_000);
        assert!(cluster.pool_capacity("other").is_empty());
    }

    #[tokio::test]
    async fn synchronized_waits_for_both_lists() {
        let cluster = std::sync::Arc::new(Cluster::new());
        assert!(!cluster.is_synchronized());

        cluster.mark_nodes_listed();
        assert!(!cluster.is_synchronized());

        let waiter = {
            let cluster = cluster.clone();
            tokio::spawn(async move { cluster.synchronized().await })
        };
        cluster.mark_claims_listed();
        waiter.await.unwrap().unwrap();
        assert!(cluster.is_synchronized());
    }

    #[test]
    fn daemon_and_static_pod_detection() {
        assert!(is_daemon_pod(&pod_on("d", "n", true)));
        assert!(!is_daemon_pod(&pod_on("a", "n", false)));

        let mirror = Pod {
            metadata: ObjectMeta {
                annotations: Some(
                    [("kubernetes.io/config.mirror".to_string(), "hash".to_string())].into(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(is_static_pod(&mirror));
    }
}
