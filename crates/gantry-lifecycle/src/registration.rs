//! Registration: bind the node that joined with the claim's provider-id
//!
//! On a match the node is patched with ownership, the termination finalizer,
//! the claim's labels and annotations, and its taints. A claim matching more
//! than one node is an invariant violation that is surfaced, not repaired.

use std::sync::Arc;

use kube::ResourceExt;
use opentelemetry::KeyValue;
use serde_json::json;
use tracing::{debug, warn};

use gantry_common::crd::{ConditionType, NodeClaim};
use gantry_common::{metrics, Result, REGISTERED_LABEL, TERMINATION_FINALIZER};

use crate::client::LifecycleClient;
use crate::Outcome;

/// The registration reconciler
pub struct Registration {
    client: Arc<dyn LifecycleClient>,
}

impl Registration {
    /// Wire up the reconciler
    pub fn new(client: Arc<dyn LifecycleClient>) -> Self {
        Self { client }
    }

    /// Drive the claim toward `Registered=true`
    pub async fn reconcile(&self, claim: &mut NodeClaim) -> Result<Outcome> {
        if claim.condition_is_true(ConditionType::Registered) {
            return Ok(Outcome::default());
        }
        if !claim.condition_is_true(ConditionType::Launched) {
            claim.status.get_or_insert_with(Default::default).mark_false(
                ConditionType::Registered,
                "NodeNotLaunched",
                "Node is not launched",
            );
            return Ok(Outcome::default());
        }

        let provider_id = claim.provider_id().unwrap_or_default().to_string();
        let nodes = self.client.nodes_for_provider_id(&provider_id).await?;
        match nodes.as_slice() {
            [] => {
                claim.status.get_or_insert_with(Default::default).mark_false(
                    ConditionType::Registered,
                    "NodeNotFound",
                    "Node not registered with cluster",
                );
                Ok(Outcome::default())
            }
            [node] => {
                let node_name = node.name_any();
                self.sync_node(claim, node).await?;
                debug!(claim = %claim.name_any(), node = %node_name, "Registered node");
                let status = claim.status.get_or_insert_with(Default::default);
                status.mark_true(ConditionType::Registered);
                status.node_name = Some(node_name);
                metrics::CLAIMS_REGISTERED.add(
                    1,
                    &[KeyValue::new(
                        "nodepool",
                        claim.pool_name().unwrap_or_default(),
                    )],
                );
                Ok(Outcome::default())
            }
            many => {
                let names: Vec<String> = many.iter().map(|n| n.name_any()).collect();
                warn!(
                    claim = %claim.name_any(),
                    nodes = ?names,
                    "Invariant violated: claim matched multiple nodes"
                );
                claim.status.get_or_insert_with(Default::default).mark_false(
                    ConditionType::Registered,
                    "MultipleNodesFound",
                    format!("claim matched nodes {}", names.join(", ")),
                );
                Ok(Outcome::default())
            }
        }
    }

    /// Patch ownership, finalizer, labels, annotations and taints onto the
    /// node
    async fn sync_node(
        &self,
        claim: &NodeClaim,
        node: &k8s_openapi::api::core::v1::Node,
    ) -> Result<()> {
        let mut labels = node.metadata.labels.clone().unwrap_or_default();
        for (k, v) in claim.labels() {
            labels.insert(k.clone(), v.clone());
        }
        labels.insert(REGISTERED_LABEL.to_string(), "true".to_string());

        let mut annotations = node.metadata.annotations.clone().unwrap_or_default();
        for (k, v) in claim.annotations() {
            annotations.insert(k.clone(), v.clone());
        }

        let mut finalizers = node.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|f| f == TERMINATION_FINALIZER) {
            finalizers.push(TERMINATION_FINALIZER.to_string());
        }

        let existing_taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();
        let claim_taints = gantry_scheduling::taints::from_specs(
            claim.spec.taints.iter().chain(&claim.spec.startup_taints),
        );
        let taints = gantry_scheduling::taints::merge(&existing_taints, &claim_taints);

        let owner_reference = json!({
            "apiVersion": "gantry.dev/v1",
            "kind": "NodeClaim",
            "name": claim.name_any(),
            "uid": claim.metadata.uid.clone().unwrap_or_default(),
            "blockOwnerDeletion": true,
        });

        self.client
            .patch_node(
                &node.name_any(),
                json!({
                    "metadata": {
                        "labels": labels,
                        "annotations": annotations,
                        "finalizers": finalizers,
                        "ownerReferences": [owner_reference],
                    },
                    "spec": { "taints": taints },
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockLifecycleClient;
    use gantry_common::crd::{NodeClaimSpec, NodeClaimStatus, TaintSpec};
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn launched_claim(name: &str) -> NodeClaim {
        let mut c = NodeClaim::new(
            name,
            NodeClaimSpec {
                startup_taints: vec![TaintSpec {
                    key: "gantry.dev/startup".into(),
                    value: None,
                    effect: "NoSchedule".into(),
                }],
                ..Default::default()
            },
        );
        c.metadata.uid = Some("uid-1".into());
        let mut status = NodeClaimStatus {
            provider_id: Some("fake:///zone-a/n1".into()),
            ..Default::default()
        };
        status.mark_true(ConditionType::Launched);
        c.status = Some(status);
        c
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn no_node_yet_keeps_registered_false() {
        let mut client = MockLifecycleClient::new();
        client
            .expect_nodes_for_provider_id()
            .returning(|_| Ok(vec![]));
        let registration = Registration::new(Arc::new(client));

        let mut c = launched_claim("default-x7k2p");
        registration.reconcile(&mut c).await.unwrap();
        let condition = c
            .status
            .as_ref()
            .unwrap()
            .condition(ConditionType::Registered)
            .unwrap();
        assert_eq!(condition.reason.as_deref(), Some("NodeNotFound"));
    }

    #[tokio::test]
    async fn matching_node_is_patched_and_claim_registered() {
        let mut client = MockLifecycleClient::new();
        client
            .expect_nodes_for_provider_id()
            .returning(|_| Ok(vec![node("node-1")]));
        client
            .expect_patch_node()
            .times(1)
            .withf(|name, patch| {
                let labels = &patch["metadata"]["labels"];
                let finalizers = patch["metadata"]["finalizers"].as_array().unwrap();
                name == "node-1"
                    && labels[REGISTERED_LABEL] == "true"
                    && finalizers.iter().any(|f| f == TERMINATION_FINALIZER)
                    && patch["spec"]["taints"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .any(|t| t["key"] == "gantry.dev/startup")
            })
            .returning(|_, _| Ok(()));
        let registration = Registration::new(Arc::new(client));

        let mut c = launched_claim("default-x7k2p");
        registration.reconcile(&mut c).await.unwrap();
        assert!(c.condition_is_true(ConditionType::Registered));
        assert_eq!(c.status.as_ref().unwrap().node_name.as_deref(), Some("node-1"));
    }

    #[tokio::test]
    async fn duplicate_nodes_mark_multiple_nodes_found() {
        let mut client = MockLifecycleClient::new();
        client
            .expect_nodes_for_provider_id()
            .returning(|_| Ok(vec![node("node-1"), node("node-2")]));
        client.expect_patch_node().never();
        let registration = Registration::new(Arc::new(client));

        let mut c = launched_claim("default-x7k2p");
        registration.reconcile(&mut c).await.unwrap();
        let condition = c
            .status
            .as_ref()
            .unwrap()
            .condition(ConditionType::Registered)
            .unwrap();
        assert_eq!(condition.reason.as_deref(), Some("MultipleNodesFound"));
        assert!(condition.message.as_deref().unwrap().contains("node-2"));
    }

    #[tokio::test]
    async fn unlaunched_claim_cannot_register() {
        let registration = Registration::new(Arc::new(MockLifecycleClient::new()));
        let mut c = NodeClaim::new("default-x7k2p", NodeClaimSpec::default());
        registration.reconcile(&mut c).await.unwrap();
        let condition = c
            .status
            .as_ref()
            .unwrap()
            .condition(ConditionType::Registered)
            .unwrap();
        assert_eq!(condition.reason.as_deref(), Some("NodeNotLaunched"));
    }
}
