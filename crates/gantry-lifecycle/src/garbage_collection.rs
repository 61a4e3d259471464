//! Garbage collection: reconcile the cloud view with the desired-state view
//!
//! Runs on a minutes-scale tick. A cloud instance with no claim that is
//! older than the not-registered TTL is deleted from the cloud; a launched
//! claim whose instance has vanished is deleted from the store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use gantry_cloud::{CloudProvider, CloudProviderError};
use gantry_common::crd::{ConditionType, NodeClaim};
use gantry_common::{metrics, Result};

use crate::client::LifecycleClient;

/// How often the diff runs
pub const GC_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// The garbage collector
pub struct GarbageCollector {
    cloud: Arc<dyn CloudProvider>,
    client: Arc<dyn LifecycleClient>,
    ttl_after_not_registered: Duration,
}

impl GarbageCollector {
    /// Wire up the collector
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        client: Arc<dyn LifecycleClient>,
        ttl_after_not_registered: Duration,
    ) -> Self {
        Self {
            cloud,
            client,
            ttl_after_not_registered,
        }
    }

    /// Run the ticking loop until cancelled
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(GC_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.collect().await {
                warn!(error = %e, "Garbage collection pass failed");
            }
        }
    }

    /// One diff pass; returns (cloud deletions, store deletions)
    pub async fn collect(&self) -> Result<(usize, usize)> {
        let instances = self
            .cloud
            .list()
            .await
            .map_err(|e| gantry_common::Error::cloud_provider("", format!("listing: {e}")))?;
        let claims = self.client.list_claims().await?;

        let claimed_ids: BTreeSet<&str> =
            claims.iter().filter_map(|c| c.provider_id()).collect();

        let mut cloud_deleted = 0usize;
        for instance in &instances {
            let Some(provider_id) = instance.provider_id() else {
                continue;
            };
            if claimed_ids.contains(provider_id) {
                continue;
            }
            let age = instance
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| (Utc::now() - t.0).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::ZERO);
            if age < self.ttl_after_not_registered {
                // a freshly launched instance may simply not be linked yet
                continue;
            }
            info!(
                provider_id,
                age_secs = age.as_secs(),
                "Deleting orphaned cloud instance"
            );
            match self.cloud.delete(instance).await {
                Ok(()) => {
                    cloud_deleted += 1;
                    metrics::CLAIMS_TERMINATED.add(
                        1,
                        &[
                            KeyValue::new("nodepool", pool_of(instance)),
                            KeyValue::new("reason", "garbage_collected"),
                        ],
                    );
                }
                Err(e) if e.is_not_found() => cloud_deleted += 1,
                Err(e) => warn!(provider_id, error = %e, "Failed to delete orphan"),
            }
        }

        let mut store_deleted = 0usize;
        for claim in &claims {
            if claim.is_terminating() || !claim.condition_is_true(ConditionType::Launched) {
                continue;
            }
            let Some(provider_id) = claim.provider_id() else {
                continue;
            };
            match self.cloud.get(provider_id).await {
                Ok(_) => {}
                Err(CloudProviderError::NotFound { .. }) => {
                    info!(
                        claim = %claim.name_any(),
                        provider_id,
                        "Cloud instance vanished; deleting claim"
                    );
                    self.client.delete_claim(&claim.name_any()).await?;
                    store_deleted += 1;
                }
                Err(e) => warn!(provider_id, error = %e, "Failed to look up instance"),
            }
        }
        Ok((cloud_deleted, store_deleted))
    }
}

fn pool_of(claim: &NodeClaim) -> String {
    claim.pool_name().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockLifecycleClient;
    use gantry_cloud::fake::FakeCloudProvider;
    use gantry_common::crd::{NodeClaimSpec, NodeClaimStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn cloud_instance(name: &str, provider_id: &str, age: Duration) -> NodeClaim {
        let mut c = NodeClaim::new(name, NodeClaimSpec::default());
        c.metadata.creation_timestamp =
            Some(Time(Utc::now() - chrono::Duration::from_std(age).unwrap()));
        c.status = Some(NodeClaimStatus {
            provider_id: Some(provider_id.to_string()),
            ..Default::default()
        });
        c
    }

    fn launched_claim(name: &str, provider_id: &str) -> NodeClaim {
        let mut c = cloud_instance(name, provider_id, Duration::from_secs(600));
        c.status.as_mut().unwrap().mark_true(ConditionType::Launched);
        c
    }

    const TTL: Duration = Duration::from_secs(15 * 60);

    #[tokio::test]
    async fn old_orphan_instances_are_deleted_from_the_cloud() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        cloud.insert_instance(cloud_instance(
            "orphan",
            "fake:///zone-a/orphan",
            Duration::from_secs(20 * 60),
        ));
        let mut client = MockLifecycleClient::new();
        client.expect_list_claims().returning(|| Ok(vec![]));
        let gc = GarbageCollector::new(cloud.clone(), Arc::new(client), TTL);

        let (cloud_deleted, store_deleted) = gc.collect().await.unwrap();
        assert_eq!((cloud_deleted, store_deleted), (1, 0));
        assert_eq!(cloud.instance_count(), 0);

        // a second pass finds nothing: deletion happens exactly once
        let mut client = MockLifecycleClient::new();
        client.expect_list_claims().returning(|| Ok(vec![]));
        let gc = GarbageCollector::new(cloud.clone(), Arc::new(client), TTL);
        assert_eq!(gc.collect().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn young_orphans_get_grace() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        cloud.insert_instance(cloud_instance(
            "fresh",
            "fake:///zone-a/fresh",
            Duration::from_secs(60),
        ));
        let mut client = MockLifecycleClient::new();
        client.expect_list_claims().returning(|| Ok(vec![]));
        let gc = GarbageCollector::new(cloud.clone(), Arc::new(client), TTL);

        assert_eq!(gc.collect().await.unwrap(), (0, 0));
        assert_eq!(cloud.instance_count(), 1);
    }

    #[tokio::test]
    async fn claimed_instances_are_never_collected() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        cloud.insert_instance(cloud_instance(
            "live",
            "fake:///zone-a/live",
            Duration::from_secs(60 * 60),
        ));
        let mut client = MockLifecycleClient::new();
        client
            .expect_list_claims()
            .returning(|| Ok(vec![launched_claim("live", "fake:///zone-a/live")]));
        client.expect_delete_claim().never();
        let gc = GarbageCollector::new(cloud.clone(), Arc::new(client), TTL);

        assert_eq!(gc.collect().await.unwrap(), (0, 0));
        assert_eq!(cloud.instance_count(), 1);
    }

    #[tokio::test]
    async fn claims_without_instances_are_deleted_from_the_store() {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        let mut client = MockLifecycleClient::new();
        client
            .expect_list_claims()
            .returning(|| Ok(vec![launched_claim("ghost", "fake:///zone-a/ghost")]));
        client
            .expect_delete_claim()
            .times(1)
            .withf(|name| name == "ghost")
            .returning(|_| Ok(()));
        let gc = GarbageCollector::new(cloud, Arc::new(client), TTL);

        assert_eq!(gc.collect().await.unwrap(), (0, 1));
    }
}
