//! Kubernetes operations shared by the lifecycle reconcilers
//!
//! Trait-seamed so reconcilers run against a mock in tests and the real
//! API server in production.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use gantry_common::crd::{NodeClaim, NodePool};
use gantry_common::Result;

/// Reads and writes used by the claim lifecycle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LifecycleClient: Send + Sync {
    /// Nodes whose `spec.providerID` matches (field-indexed in production)
    async fn nodes_for_provider_id(&self, provider_id: &str) -> Result<Vec<Node>>;

    /// Merge-patch a node's metadata and spec
    async fn patch_node(&self, name: &str, patch: serde_json::Value) -> Result<()>;

    /// Replace a claim's status subresource
    async fn update_claim_status(&self, claim: &NodeClaim) -> Result<()>;

    /// Delete a claim by name; success on not-found
    async fn delete_claim(&self, name: &str) -> Result<()>;

    /// All claims in the store
    async fn list_claims(&self) -> Result<Vec<NodeClaim>>;

    /// A pool by name
    async fn get_pool(&self, name: &str) -> Result<Option<NodePool>>;

    /// Pods bound to the named node
    async fn pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
}

/// Production implementation
pub struct KubeLifecycleClient {
    client: Client,
}

impl KubeLifecycleClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LifecycleClient for KubeLifecycleClient {
    async fn nodes_for_provider_id(&self, provider_id: &str) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default().fields(&format!("spec.providerID={provider_id}")))
            .await?;
        Ok(nodes.items)
    }

    async fn patch_node(&self, name: &str, patch: serde_json::Value) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(
            name,
            &PatchParams::apply("gantry-lifecycle"),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn update_claim_status(&self, claim: &NodeClaim) -> Result<()> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": claim.status });
        api.patch_status(
            &claim.name_any(),
            &PatchParams::apply("gantry-lifecycle"),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn delete_claim(&self, name: &str) -> Result<()> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_claims(&self) -> Result<Vec<NodeClaim>> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_pool(&self, name: &str) -> Result<Option<NodePool>> {
        let api: Api<NodePool> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(pool) => Ok(Some(pool)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().fields(&format!("spec.nodeName={node_name}")))
            .await?;
        Ok(pods.items)
    }
}
