//! Initialization: the node is ready for general workloads
//!
//! A claim initializes once its node reports kubelet Ready, every startup
//! taint has been removed by the responsible agent, and the node's
//! allocatable covers the resources the claim was created for.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use gantry_common::crd::{ConditionType, NodeClaim};
use gantry_common::{resources, Result, INITIALIZED_LABEL};

use crate::client::LifecycleClient;
use crate::Outcome;

const RECHECK: Duration = Duration::from_secs(30);

/// The initialization reconciler
pub struct Initialization {
    client: Arc<dyn LifecycleClient>,
}

impl Initialization {
    /// Wire up the reconciler
    pub fn new(client: Arc<dyn LifecycleClient>) -> Self {
        Self { client }
    }

    /// Drive the claim toward `Initialized=true`
    pub async fn reconcile(&self, claim: &mut NodeClaim) -> Result<Outcome> {
        if claim.condition_is_true(ConditionType::Initialized) {
            return Ok(Outcome::default());
        }
        if !claim.condition_is_true(ConditionType::Registered) {
            return Ok(Outcome::default());
        }

        let provider_id = claim.provider_id().unwrap_or_default().to_string();
        let nodes = self.client.nodes_for_provider_id(&provider_id).await?;
        let [node] = nodes.as_slice() else {
            return Ok(Outcome::requeue(RECHECK));
        };

        if let Some(reason) = initialization_blocker(claim, node) {
            debug!(claim = %claim.name_any(), reason = %reason.1, "Node not initialized yet");
            claim.status.get_or_insert_with(Default::default).mark_false(
                ConditionType::Initialized,
                reason.0,
                reason.1,
            );
            return Ok(Outcome::requeue(RECHECK));
        }

        self.client
            .patch_node(
                &node.name_any(),
                json!({ "metadata": { "labels": { INITIALIZED_LABEL: "true" } } }),
            )
            .await?;
        claim
            .status
            .get_or_insert_with(Default::default)
            .mark_true(ConditionType::Initialized);
        debug!(claim = %claim.name_any(), node = %node.name_any(), "Node initialized");
        Ok(Outcome::default())
    }
}

/// The first reason the node is not yet initialized, if any
fn initialization_blocker(claim: &NodeClaim, node: &Node) -> Option<(&'static str, String)> {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    if !ready {
        return Some(("NodeNotReady", "kubelet has not reported Ready".into()));
    }

    let node_taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .cloned()
        .unwrap_or_default();
    for startup in &claim.spec.startup_taints {
        if node_taints
            .iter()
            .any(|t| t.key == startup.key && t.effect == startup.effect)
        {
            return Some((
                "StartupTaintsPresent",
                format!("startup taint {} has not been removed", startup.key),
            ));
        }
    }

    let allocatable = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.clone())
        .unwrap_or_default();
    let requests = claim
        .spec
        .resources
        .as_ref()
        .map(|r| r.requests.clone())
        .unwrap_or_default();
    if !resources::fits(&requests, &allocatable) {
        return Some((
            "ResourcesNotReported",
            "node allocatable does not cover the claim's requests".into(),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockLifecycleClient;
    use gantry_common::crd::{NodeClaimSpec, NodeClaimStatus, ResourceClaim, TaintSpec};
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus, Taint};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn registered_claim() -> NodeClaim {
        let mut c = NodeClaim::new(
            "default-x7k2p",
            NodeClaimSpec {
                startup_taints: vec![TaintSpec {
                    key: "cni.example.com/uninitialized".into(),
                    value: None,
                    effect: "NoSchedule".into(),
                }],
                resources: Some(ResourceClaim {
                    requests: [("cpu".to_string(), Quantity("2".into()))].into(),
                }),
                ..Default::default()
            },
        );
        let mut status = NodeClaimStatus {
            provider_id: Some("fake:///zone-a/n1".into()),
            node_name: Some("node-1".into()),
            ..Default::default()
        };
        status.mark_true(ConditionType::Launched);
        status.mark_true(ConditionType::Registered);
        c.status = Some(status);
        c
    }

    fn node(ready: bool, tainted: bool, cpu: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".into()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: tainted.then(|| {
                    vec![Taint {
                        key: "cni.example.com/uninitialized".into(),
                        effect: "NoSchedule".into(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..Default::default()
                }]),
                allocatable: Some([("cpu".to_string(), Quantity(cpu.into()))].into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn run(node: Node, expect_patch: bool) -> NodeClaim {
        let mut client = MockLifecycleClient::new();
        client
            .expect_nodes_for_provider_id()
            .returning(move |_| Ok(vec![node.clone()]));
        if expect_patch {
            client.expect_patch_node().times(1).returning(|_, _| Ok(()));
        } else {
            client.expect_patch_node().never();
        }
        let initialization = Initialization::new(Arc::new(client));
        let mut claim = registered_claim();
        initialization.reconcile(&mut claim).await.unwrap();
        claim
    }

    #[tokio::test]
    async fn ready_untainted_node_initializes() {
        let claim = run(node(true, false, "4"), true).await;
        assert!(claim.condition_is_true(ConditionType::Initialized));
    }

    #[tokio::test]
    async fn not_ready_node_blocks() {
        let claim = run(node(false, false, "4"), false).await;
        let condition = claim
            .status
            .as_ref()
            .unwrap()
            .condition(ConditionType::Initialized)
            .unwrap();
        assert_eq!(condition.reason.as_deref(), Some("NodeNotReady"));
    }

    #[tokio::test]
    async fn lingering_startup_taint_blocks() {
        let claim = run(node(true, true, "4"), false).await;
        let condition = claim
            .status
            .as_ref()
            .unwrap()
            .condition(ConditionType::Initialized)
            .unwrap();
        assert_eq!(condition.reason.as_deref(), Some("StartupTaintsPresent"));
    }

    #[tokio::test]
    async fn short_allocatable_blocks() {
        let claim = run(node(true, false, "1"), false).await;
        let condition = claim
            .status
            .as_ref()
            .unwrap()
            .condition(ConditionType::Initialized)
            .unwrap();
        assert_eq!(condition.reason.as_deref(), Some("ResourcesNotReported"));
    }

    #[tokio::test]
    async fn initialization_requires_registration() {
        let initialization = Initialization::new(Arc::new(MockLifecycleClient::new()));
        let mut claim = NodeClaim::new("default-x7k2p", NodeClaimSpec::default());
        let outcome = initialization.reconcile(&mut claim).await.unwrap();
        assert!(!outcome.deleted);
        assert!(!claim.condition_is_true(ConditionType::Initialized));
    }
}
