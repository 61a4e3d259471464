//! The claim termination controller
//!
//! Runs on claims with a deletion timestamp. Order is strict: cordon, drain
//! to empty, delete the cloud instance, delete the node object, and only
//! then remove the claim's finalizer. A pass interrupted anywhere resumes
//! on the next reconcile.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use opentelemetry::KeyValue;
use serde_json::json;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use gantry_cloud::CloudProvider;
use gantry_common::crd::NodeClaim;
use gantry_common::{metrics, Error, Result, TERMINATION_FINALIZER};

use crate::terminator::{DrainStatus, TerminationClient, Terminator};

const DRAIN_REQUEUE: Duration = Duration::from_secs(5);

/// Claim writes used during termination
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TerminationClaimClient: Send + Sync {
    /// Remove the termination finalizer from the claim
    async fn remove_finalizer(&self, claim: &NodeClaim) -> Result<()>;
}

/// Production implementation
pub struct KubeTerminationClaimClient {
    client: Client,
}

impl KubeTerminationClaimClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TerminationClaimClient for KubeTerminationClaimClient {
    async fn remove_finalizer(&self, claim: &NodeClaim) -> Result<()> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        let finalizers: Vec<String> = claim
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != TERMINATION_FINALIZER)
            .cloned()
            .collect();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        match api
            .patch(
                &claim.name_any(),
                &PatchParams::apply("gantry-termination"),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared context for the termination controller
pub struct Context {
    /// Cordon/drain driver
    pub terminator: Terminator,
    /// Node reads during teardown
    pub nodes: Arc<dyn TerminationClient>,
    /// Finalizer removal
    pub claims: Arc<dyn TerminationClaimClient>,
    /// Instance deletion
    pub cloud: Arc<dyn CloudProvider>,
}

/// Reconcile one terminating claim
pub async fn reconcile(claim: Arc<NodeClaim>, ctx: Arc<Context>) -> Result<Action> {
    if !claim.is_terminating() {
        return Ok(Action::await_change());
    }
    if !claim
        .finalizers()
        .iter()
        .any(|f| f == TERMINATION_FINALIZER)
    {
        // nothing left to guarantee
        return Ok(Action::await_change());
    }

    // drain whichever node registered for this claim
    if let Some(node_name) = claim.status.as_ref().and_then(|s| s.node_name.clone()) {
        if let Some(node) = ctx.nodes.get_node(&node_name).await? {
            ctx.terminator.cordon(&node).await?;
            match ctx.terminator.drain(&node_name).await? {
                DrainStatus::Draining => {
                    return Ok(Action::requeue(DRAIN_REQUEUE));
                }
                DrainStatus::Drained => {}
            }
        }
    }

    // the instance goes before the node object and the finalizer
    match ctx.cloud.delete(&claim).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            return Err(Error::cloud_provider(
                claim.name_any(),
                format!("deleting instance: {e}"),
            ))
        }
    }

    if let Some(node_name) = claim.status.as_ref().and_then(|s| s.node_name.clone()) {
        ctx.terminator.finish(&node_name).await?;
    }

    ctx.claims.remove_finalizer(&claim).await?;
    metrics::CLAIMS_TERMINATED.add(
        1,
        &[
            KeyValue::new("nodepool", claim.pool_name().unwrap_or_default()),
            KeyValue::new("reason", "deleted"),
        ],
    );
    if let Some(deleted_at) = claim.metadata.deletion_timestamp.as_ref() {
        let drained_in = (chrono::Utc::now() - deleted_at.0)
            .to_std()
            .unwrap_or_default();
        metrics::DRAIN_DURATION.record(drained_in.as_secs_f64(), &[]);
    }
    info!(claim = %claim.name_any(), "Claim torn down");
    Ok(Action::await_change())
}

/// Error policy for the termination controller
pub fn error_policy(claim: Arc<NodeClaim>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(claim = %claim.name_any(), error = %error, "Termination error, will retry");
    Action::requeue(Duration::from_secs(10))
}
