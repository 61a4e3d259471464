//! Liveness: give up on claims that never launch or never register
//!
//! A claim that has not launched within the launch TTL, or has launched but
//! seen no node within the registration TTL, is deleted so a fresh
//! scheduling pass can try again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use opentelemetry::KeyValue;
use tracing::info;

use gantry_common::crd::{ConditionType, NodeClaim};
use gantry_common::{metrics, Result};

use crate::client::LifecycleClient;
use crate::Outcome;

/// How long a claim may stay unlaunched before it is abandoned
pub const LAUNCH_TTL: Duration = Duration::from_secs(2 * 60);

/// How long a launched claim may stay unregistered before it is abandoned
pub const REGISTRATION_TTL: Duration = Duration::from_secs(15 * 60);

/// The liveness reconciler
pub struct Liveness {
    client: Arc<dyn LifecycleClient>,
}

impl Liveness {
    /// Wire up the reconciler
    pub fn new(client: Arc<dyn LifecycleClient>) -> Self {
        Self { client }
    }

    /// Enforce the launch and registration deadlines
    pub async fn reconcile(&self, claim: &NodeClaim) -> Result<Outcome> {
        if claim.condition_is_true(ConditionType::Registered) {
            return Ok(Outcome::default());
        }

        if !claim.condition_is_true(ConditionType::Launched) {
            return self
                .enforce(
                    claim,
                    claim
                        .metadata
                        .creation_timestamp
                        .as_ref()
                        .map(|t| t.0)
                        .unwrap_or_else(Utc::now),
                    LAUNCH_TTL,
                    "launch_timeout",
                )
                .await;
        }

        let launched_at = claim
            .condition_transitioned_at(ConditionType::Launched)
            .unwrap_or_else(Utc::now);
        self.enforce(claim, launched_at, REGISTRATION_TTL, "registration_timeout")
            .await
    }

    async fn enforce(
        &self,
        claim: &NodeClaim,
        since: chrono::DateTime<chrono::Utc>,
        ttl: Duration,
        reason: &'static str,
    ) -> Result<Outcome> {
        let elapsed = (Utc::now() - since)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed < ttl {
            return Ok(Outcome::requeue(ttl - elapsed));
        }
        info!(
            claim = %claim.name_any(),
            reason,
            ttl_secs = ttl.as_secs(),
            "Deleting claim that missed its deadline"
        );
        self.client.delete_claim(&claim.name_any()).await?;
        metrics::CLAIMS_TERMINATED.add(
            1,
            &[
                KeyValue::new("nodepool", claim.pool_name().unwrap_or_default()),
                KeyValue::new("reason", reason),
            ],
        );
        Ok(Outcome::deleted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockLifecycleClient;
    use gantry_common::crd::{Condition, ConditionStatus, NodeClaimSpec, NodeClaimStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn claim_created_at(age: Duration) -> NodeClaim {
        let mut c = NodeClaim::new("default-x7k2p", NodeClaimSpec::default());
        c.metadata.creation_timestamp =
            Some(Time(Utc::now() - chrono::Duration::from_std(age).unwrap()));
        c
    }

    fn launched_at(age: Duration) -> NodeClaim {
        let mut c = claim_created_at(age + Duration::from_secs(10));
        let mut status = NodeClaimStatus::default();
        let mut condition = Condition::new(ConditionType::Launched, ConditionStatus::True);
        condition.last_transition_time =
            Utc::now() - chrono::Duration::from_std(age).unwrap();
        status.set_condition(condition);
        c.status = Some(status);
        c
    }

    #[tokio::test]
    async fn young_unlaunched_claim_requeues_until_deadline() {
        let mut client = MockLifecycleClient::new();
        client.expect_delete_claim().never();
        let liveness = Liveness::new(Arc::new(client));
        let outcome = liveness
            .reconcile(&claim_created_at(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(!outcome.deleted);
        let requeue = outcome.requeue_after.unwrap();
        assert!(requeue <= Duration::from_secs(90));
    }

    #[tokio::test]
    async fn stale_unlaunched_claim_is_deleted() {
        let mut client = MockLifecycleClient::new();
        client.expect_delete_claim().times(1).returning(|_| Ok(()));
        let liveness = Liveness::new(Arc::new(client));
        let outcome = liveness
            .reconcile(&claim_created_at(Duration::from_secs(3 * 60)))
            .await
            .unwrap();
        assert!(outcome.deleted);
    }

    #[tokio::test]
    async fn launched_claim_gets_the_registration_ttl() {
        let mut client = MockLifecycleClient::new();
        client.expect_delete_claim().never();
        let liveness = Liveness::new(Arc::new(client));
        // past the launch TTL but within the registration TTL
        let outcome = liveness
            .reconcile(&launched_at(Duration::from_secs(5 * 60)))
            .await
            .unwrap();
        assert!(!outcome.deleted);
    }

    #[tokio::test]
    async fn unregistered_claim_is_deleted_after_registration_ttl() {
        let mut client = MockLifecycleClient::new();
        client.expect_delete_claim().times(1).returning(|_| Ok(()));
        let liveness = Liveness::new(Arc::new(client));
        let outcome = liveness
            .reconcile(&launched_at(Duration::from_secs(16 * 60)))
            .await
            .unwrap();
        assert!(outcome.deleted);
    }

    #[tokio::test]
    async fn registered_claim_is_left_alone() {
        let mut client = MockLifecycleClient::new();
        client.expect_delete_claim().never();
        let liveness = Liveness::new(Arc::new(client));
        let mut c = launched_at(Duration::from_secs(60 * 60));
        c.status.as_mut().unwrap().mark_true(ConditionType::Registered);
        let outcome = liveness.reconcile(&c).await.unwrap();
        assert!(!outcome.deleted);
        assert!(outcome.requeue_after.is_none());
    }
}
