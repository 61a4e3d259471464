//! Launch: ask the cloud provider for an instance backing the claim
//!
//! Insufficient capacity deletes the claim and poisons the offering in the
//! unavailable cache; a fresh scheduling pass then picks a different shape.
//! Other failures mark `Launched=false` and retry with backoff. A short
//! per-UID cache of the created representation tolerates read-after-write
//! lag in the store: a repeated reconcile sees the cached instance instead
//! of creating a second one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kube::ResourceExt;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use gantry_cloud::{CloudProvider, CloudProviderError, UnavailableOfferings};
use gantry_common::crd::{ConditionType, NodeClaim};
use gantry_common::error::truncate_message;
use gantry_common::events::{actions, reasons, EventPublisher};
use gantry_common::{metrics, Error, Result};
use gantry_scheduling::Requirements;
use kube::runtime::events::EventType;

use crate::client::LifecycleClient;
use crate::Outcome;

const LAUNCH_CACHE_TTL: Duration = Duration::from_secs(60);

/// The launch reconciler
pub struct Launch {
    cloud: Arc<dyn CloudProvider>,
    client: Arc<dyn LifecycleClient>,
    unavailable: Arc<UnavailableOfferings>,
    events: Arc<dyn EventPublisher>,
    cache: DashMap<String, (NodeClaim, Instant)>,
}

impl Launch {
    /// Wire up the reconciler
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        client: Arc<dyn LifecycleClient>,
        unavailable: Arc<UnavailableOfferings>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            cloud,
            client,
            unavailable,
            events,
            cache: DashMap::new(),
        }
    }

    /// Drive the claim toward `Launched=true`
    pub async fn reconcile(&self, claim: &mut NodeClaim) -> Result<Outcome> {
        if claim.condition_is_true(ConditionType::Launched) {
            return Ok(Outcome::default());
        }

        let uid = claim.metadata.uid.clone().unwrap_or_default();
        let cached = self
            .cache
            .get(&uid)
            .filter(|entry| entry.1.elapsed() < LAUNCH_CACHE_TTL)
            .map(|entry| entry.0.clone());

        let created = match cached {
            Some(created) => created,
            None => match self.launch(claim).await? {
                Some(created) => created,
                // the claim was deleted (insufficient capacity)
                None => return Ok(Outcome::deleted()),
            },
        };
        self.cache.insert(uid, (created.clone(), Instant::now()));

        populate_launch_details(claim, &created);
        claim
            .status
            .get_or_insert_with(Default::default)
            .mark_true(ConditionType::Launched);
        metrics::CLAIMS_LAUNCHED.add(
            1,
            &[KeyValue::new(
                "nodepool",
                claim.pool_name().unwrap_or_default(),
            )],
        );
        Ok(Outcome::default())
    }

    async fn launch(&self, claim: &mut NodeClaim) -> Result<Option<NodeClaim>> {
        match self.cloud.create(claim).await {
            Ok(created) => {
                info!(
                    claim = %claim.name_any(),
                    provider_id = created.provider_id().unwrap_or(""),
                    instance_type = created
                        .labels()
                        .get(gantry_common::INSTANCE_TYPE_LABEL)
                        .map(String::as_str)
                        .unwrap_or(""),
                    zone = created
                        .labels()
                        .get(gantry_common::ZONE_LABEL)
                        .map(String::as_str)
                        .unwrap_or(""),
                    "Launched instance"
                );
                Ok(Some(created))
            }
            Err(CloudProviderError::InsufficientCapacity {
                instance_type,
                zone,
                capacity_type,
            }) => {
                warn!(
                    claim = %claim.name_any(),
                    %instance_type,
                    %zone,
                    %capacity_type,
                    "Insufficient capacity; deleting claim"
                );
                self.unavailable.mark(&instance_type, &zone, &capacity_type);
                let reference = k8s_openapi::api::core::v1::ObjectReference {
                    kind: Some("NodeClaim".into()),
                    name: claim.metadata.name.clone(),
                    uid: claim.metadata.uid.clone(),
                    ..Default::default()
                };
                self.events
                    .publish(
                        &reference,
                        EventType::Warning,
                        reasons::INSUFFICIENT_CAPACITY,
                        actions::LIFECYCLE,
                        Some(format!(
                            "no capacity for {instance_type} in {zone} ({capacity_type})"
                        )),
                    )
                    .await;
                self.client.delete_claim(&claim.name_any()).await?;
                metrics::CLAIMS_TERMINATED.add(
                    1,
                    &[
                        KeyValue::new("nodepool", claim.pool_name().unwrap_or_default()),
                        KeyValue::new("reason", "insufficient_capacity"),
                    ],
                );
                Ok(None)
            }
            Err(e) => {
                claim.status.get_or_insert_with(Default::default).mark_false(
                    ConditionType::Launched,
                    "LaunchFailed",
                    truncate_message(&e.to_string()),
                );
                Err(Error::cloud_provider(
                    claim.name_any(),
                    format!("creating instance: {e}"),
                ))
            }
        }
    }
}

/// Copy the provider's resolved details onto the claim
///
/// Label priority: provider-resolved labels, then single-value requirement
/// labels, then user labels (user labels win).
fn populate_launch_details(claim: &mut NodeClaim, created: &NodeClaim) {
    let requirement_labels = Requirements::from_specs(&claim.spec.requirements).labels();
    let user_labels = claim.labels().clone();

    let labels = claim.labels_mut();
    for (k, v) in created.labels() {
        labels.insert(k.clone(), v.clone());
    }
    for (k, v) in requirement_labels {
        labels.insert(k, v);
    }
    for (k, v) in user_labels {
        labels.insert(k, v);
    }

    for (k, v) in created.annotations() {
        claim.annotations_mut().insert(k.clone(), v.clone());
    }

    let created_status = created.status.clone().unwrap_or_default();
    let status = claim.status.get_or_insert_with(Default::default);
    status.provider_id = created_status.provider_id;
    status.image_id = created_status.image_id;
    status.capacity = created_status.capacity;
    status.allocatable = created_status.allocatable;
}
