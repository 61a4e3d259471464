//! Disruption marking: drift, emptiness and expiration conditions
//!
//! These reconcilers only observe and mark; acting on the marks is the
//! disruption planner's job. Dynamic drift asks the cloud provider at a
//! bounded cadence; static drift compares the claim's recorded pool template
//! hash against the pool's current one and is checked on every pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use kube::ResourceExt;
use tracing::{debug, info};

use gantry_cloud::CloudProvider;
use gantry_common::crd::{
    ConditionStatus, ConditionType, ConsolidationPolicy, NodeClaim, NodePool,
};
use gantry_common::{Error, Result, NODEPOOL_HASH_ANNOTATION};
use gantry_state::is_daemon_pod;

use crate::client::LifecycleClient;
use crate::Outcome;

/// How often dynamic drift is asked of the cloud provider, per claim
pub const DRIFT_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The marking reconciler
pub struct Marking {
    cloud: Arc<dyn CloudProvider>,
    client: Arc<dyn LifecycleClient>,
    drift_checked: DashMap<String, Instant>,
    drift_enabled: bool,
}

impl Marking {
    /// Wire up the reconciler
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        client: Arc<dyn LifecycleClient>,
        drift_enabled: bool,
    ) -> Self {
        Self {
            cloud,
            client,
            drift_checked: DashMap::new(),
            drift_enabled,
        }
    }

    /// Evaluate drift, emptiness and expiration for an initialized claim
    pub async fn reconcile(&self, claim: &mut NodeClaim) -> Result<Outcome> {
        if !claim.condition_is_true(ConditionType::Launched) {
            return Ok(Outcome::default());
        }
        let Some(pool) = self
            .client
            .get_pool(&claim.pool_name().unwrap_or_default())
            .await?
        else {
            // the pool is gone; the disruption planner treats the claim as
            // drifted via the missing owner
            return Ok(Outcome::default());
        };

        let mut outcome = Outcome::default();
        if self.drift_enabled {
            self.mark_drift(claim, &pool).await?;
        }
        self.mark_expiration(claim, &pool, &mut outcome)?;
        self.mark_emptiness(claim, &pool).await?;
        Ok(outcome)
    }

    async fn mark_drift(&self, claim: &mut NodeClaim, pool: &NodePool) -> Result<()> {
        // static drift is local and cheap: check it every pass
        let recorded = claim
            .annotations()
            .get(NODEPOOL_HASH_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        let current = pool.spec.template_hash();
        if !recorded.is_empty() && recorded != current {
            self.set_drifted(claim, "NodePoolChanged");
            return Ok(());
        }

        // dynamic drift at a bounded cadence per claim
        let uid = claim.metadata.uid.clone().unwrap_or_default();
        let due = self
            .drift_checked
            .get(&uid)
            .map(|at| at.elapsed() >= DRIFT_CHECK_INTERVAL)
            .unwrap_or(true);
        if !due {
            return Ok(());
        }
        self.drift_checked.insert(uid, Instant::now());

        match self.cloud.is_drifted(claim).await {
            Ok(Some(reason)) => self.set_drifted(claim, &reason),
            Ok(None) => {
                let claim_name = claim.name_any();
                if let Some(status) = claim.status.as_mut() {
                    if status.is_true(ConditionType::Drifted) {
                        debug!(claim = %claim_name, "Drift cleared");
                        status.mark_false(ConditionType::Drifted, "NotDrifted", "");
                    }
                }
            }
            Err(e) => {
                return Err(Error::cloud_provider(
                    claim.name_any(),
                    format!("checking drift: {e}"),
                ))
            }
        }
        Ok(())
    }

    fn set_drifted(&self, claim: &mut NodeClaim, reason: &str) {
        let claim_name = claim.name_any();
        let status = claim.status.get_or_insert_with(Default::default);
        if !status.is_true(ConditionType::Drifted) {
            info!(claim = %claim_name, reason, "Claim drifted");
            status.set_condition(
                gantry_common::crd::Condition::new(ConditionType::Drifted, ConditionStatus::True)
                    .with_reason(reason.to_string(), ""),
            );
        }
    }

    fn mark_expiration(
        &self,
        claim: &mut NodeClaim,
        pool: &NodePool,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let Some(ttl) = pool.spec.disruption.expire_after()? else {
            return Ok(());
        };
        let Some(created) = claim.metadata.creation_timestamp.as_ref().map(|t| t.0) else {
            return Ok(());
        };
        let age = (Utc::now() - created).to_std().unwrap_or(Duration::ZERO);
        if age >= ttl {
            let claim_name = claim.name_any();
            let status = claim.status.get_or_insert_with(Default::default);
            if !status.is_true(ConditionType::Expired) {
                info!(claim = %claim_name, age_secs = age.as_secs(), "Claim expired");
                status.mark_true(ConditionType::Expired);
            }
        } else {
            outcome.merge_requeue(ttl - age);
        }
        Ok(())
    }

    async fn mark_emptiness(&self, claim: &mut NodeClaim, pool: &NodePool) -> Result<()> {
        if pool.spec.disruption.consolidation_policy != ConsolidationPolicy::WhenEmpty {
            return Ok(());
        }
        if !claim.condition_is_true(ConditionType::Initialized) {
            return Ok(());
        }
        let Some(node_name) = claim
            .status
            .as_ref()
            .and_then(|s| s.node_name.clone())
        else {
            return Ok(());
        };

        let pods = self.client.pods_on_node(&node_name).await?;
        let workload_pods = pods.iter().filter(|p| !is_daemon_pod(p)).count();
        let claim_name = claim.name_any();
        let status = claim.status.get_or_insert_with(Default::default);
        if workload_pods == 0 {
            if !status.is_true(ConditionType::Empty) {
                debug!(claim = %claim_name, "Claim is empty");
                status.mark_true(ConditionType::Empty);
            }
        } else if status.is_true(ConditionType::Empty) {
            status.mark_false(ConditionType::Empty, "PodsPresent", format!("{workload_pods} pods"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockLifecycleClient;
    use gantry_cloud::fake::FakeCloudProvider;
    use gantry_common::crd::{
        DisruptionSpec, NodeClaimSpec, NodeClaimStatus, NodeClaimTemplateSpec, NodePoolSpec,
    };
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

    fn pool(policy: ConsolidationPolicy, expire_after: Option<&str>) -> NodePool {
        NodePool::new(
            "default",
            NodePoolSpec {
                template: NodeClaimTemplateSpec {
                    spec: NodeClaimSpec::default(),
                    ..Default::default()
                },
                disruption: DisruptionSpec {
                    consolidation_policy: policy,
                    expire_after: expire_after.map(String::from),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn launched_claim(age: Duration) -> NodeClaim {
        let mut c = NodeClaim::new("default-x7k2p", NodeClaimSpec::default());
        c.metadata.uid = Some("uid-1".into());
        c.metadata.creation_timestamp =
            Some(Time(Utc::now() - chrono::Duration::from_std(age).unwrap()));
        c.labels_mut()
            .insert(gantry_common::NODEPOOL_LABEL.to_string(), "default".into());
        let mut status = NodeClaimStatus {
            provider_id: Some("fake:///zone-a/n1".into()),
            node_name: Some("node-1".into()),
            ..Default::default()
        };
        status.mark_true(ConditionType::Launched);
        status.mark_true(ConditionType::Registered);
        status.mark_true(ConditionType::Initialized);
        c.status = Some(status);
        c
    }

    fn client_with_pool(pool: NodePool) -> MockLifecycleClient {
        let mut client = MockLifecycleClient::new();
        client
            .expect_get_pool()
            .returning(move |_| Ok(Some(pool.clone())));
        client
    }

    fn daemon_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                owner_references: Some(vec![OwnerReference {
                    kind: "DaemonSet".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dynamic_drift_marks_the_claim() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        cloud.mark_drifted("fake:///zone-a/n1", "image outdated");
        let client = client_with_pool(pool(ConsolidationPolicy::WhenUnderutilized, None));
        let marking = Marking::new(cloud, Arc::new(client), true);

        let mut claim = launched_claim(Duration::from_secs(60));
        marking.reconcile(&mut claim).await.unwrap();
        assert!(claim.condition_is_true(ConditionType::Drifted));
        let condition = claim
            .status
            .as_ref()
            .unwrap()
            .condition(ConditionType::Drifted)
            .unwrap();
        assert_eq!(condition.reason.as_deref(), Some("image outdated"));
    }

    #[tokio::test]
    async fn drift_checks_are_cadence_limited() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        let client = client_with_pool(pool(ConsolidationPolicy::WhenUnderutilized, None));
        let marking = Marking::new(cloud.clone(), Arc::new(client), true);

        let mut claim = launched_claim(Duration::from_secs(60));
        marking.reconcile(&mut claim).await.unwrap();
        // drift appears right after the first check: not seen until cadence
        cloud.mark_drifted("fake:///zone-a/n1", "image outdated");
        marking.reconcile(&mut claim).await.unwrap();
        assert!(!claim.condition_is_true(ConditionType::Drifted));
    }

    #[tokio::test]
    async fn disabled_drift_never_asks_the_cloud() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        cloud.mark_drifted("fake:///zone-a/n1", "image outdated");
        let client = client_with_pool(pool(ConsolidationPolicy::WhenUnderutilized, None));
        let marking = Marking::new(cloud, Arc::new(client), false);

        let mut claim = launched_claim(Duration::from_secs(60));
        marking.reconcile(&mut claim).await.unwrap();
        assert!(!claim.condition_is_true(ConditionType::Drifted));
    }

    #[tokio::test]
    async fn static_drift_fires_on_pool_hash_mismatch() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        let client = client_with_pool(pool(ConsolidationPolicy::WhenUnderutilized, None));
        let marking = Marking::new(cloud, Arc::new(client), true);

        let mut claim = launched_claim(Duration::from_secs(60));
        claim
            .annotations_mut()
            .insert(NODEPOOL_HASH_ANNOTATION.to_string(), "stale-hash".into());
        marking.reconcile(&mut claim).await.unwrap();
        let condition = claim
            .status
            .as_ref()
            .unwrap()
            .condition(ConditionType::Drifted)
            .unwrap();
        assert_eq!(condition.reason.as_deref(), Some("NodePoolChanged"));
    }

    #[tokio::test]
    async fn expiration_marks_old_claims_only() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        let client = client_with_pool(pool(
            ConsolidationPolicy::WhenUnderutilized,
            Some("1h"),
        ));
        let marking = Marking::new(cloud, Arc::new(client), false);

        let mut young = launched_claim(Duration::from_secs(60));
        let outcome = marking.reconcile(&mut young).await.unwrap();
        assert!(!young.condition_is_true(ConditionType::Expired));
        assert!(outcome.requeue_after.is_some());

        let mut old = launched_claim(Duration::from_secs(2 * 60 * 60));
        marking.reconcile(&mut old).await.unwrap();
        assert!(old.condition_is_true(ConditionType::Expired));
    }

    #[tokio::test]
    async fn emptiness_tracks_non_daemon_pods() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        let mut client = client_with_pool(pool(ConsolidationPolicy::WhenEmpty, None));
        client
            .expect_pods_on_node()
            .returning(|_| Ok(vec![daemon_pod()]));
        let marking = Marking::new(cloud, Arc::new(client), false);

        let mut claim = launched_claim(Duration::from_secs(60));
        marking.reconcile(&mut claim).await.unwrap();
        // only a daemon pod runs there: the claim is empty
        assert!(claim.condition_is_true(ConditionType::Empty));
    }

    #[tokio::test]
    async fn workload_pods_clear_emptiness() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        let mut client = client_with_pool(pool(ConsolidationPolicy::WhenEmpty, None));
        client
            .expect_pods_on_node()
            .returning(|_| Ok(vec![Pod::default()]));
        let marking = Marking::new(cloud, Arc::new(client), false);

        let mut claim = launched_claim(Duration::from_secs(60));
        claim
            .status
            .as_mut()
            .unwrap()
            .mark_true(ConditionType::Empty);
        marking.reconcile(&mut claim).await.unwrap();
        assert!(!claim.condition_is_true(ConditionType::Empty));
    }
}
