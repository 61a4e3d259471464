//! In-memory cloud provider for tests
//!
//! Behaves like a real adapter: launches pick the cheapest offering the
//! claim's requirements allow, scripted offerings fail with insufficient
//! capacity, and the instance store backs `get`/`list`/`delete` so the
//! lifecycle and garbage-collection flows can be exercised end to end.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use gantry_common::crd::{NodeClaim, NodeClaimStatus};
use gantry_common::resources::{quantity_from_millis, ResourceList};
use gantry_common::{CAPACITY_TYPE_LABEL, INSTANCE_TYPE_LABEL, ZONE_LABEL};
use gantry_scheduling::Requirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use crate::instance_type::{
    order_by_price, standard_requirements, InstanceType, Offering, ON_DEMAND, SPOT,
};
use crate::{overhead, CloudProvider, CloudProviderError, DriftReason};

/// Configurable fake provider
#[derive(Default)]
pub struct FakeCloudProvider {
    catalog: std::sync::RwLock<Vec<InstanceType>>,
    instances: DashMap<String, NodeClaim>,
    insufficient: DashMap<(String, String, String), ()>,
    drifted: DashMap<String, DriftReason>,
    create_calls: AtomicUsize,
    transient_failures: AtomicUsize,
}

impl FakeCloudProvider {
    /// A provider with the given catalog
    pub fn with_catalog(catalog: Vec<InstanceType>) -> Self {
        Self {
            catalog: std::sync::RwLock::new(catalog),
            ..Default::default()
        }
    }

    /// A provider with the default three-zone general purpose catalog
    pub fn with_default_catalog() -> Self {
        Self::with_catalog(default_catalog())
    }

    /// Script an offering to return insufficient capacity on launch
    pub fn mark_insufficient(&self, instance_type: &str, zone: &str, capacity_type: &str) {
        self.insufficient.insert(
            (
                instance_type.to_string(),
                zone.to_string(),
                capacity_type.to_string(),
            ),
            (),
        );
    }

    /// Clear a scripted insufficient-capacity offering
    pub fn clear_insufficient(&self, instance_type: &str, zone: &str, capacity_type: &str) {
        self.insufficient.remove(&(
            instance_type.to_string(),
            zone.to_string(),
            capacity_type.to_string(),
        ));
    }

    /// Script the next `n` creates to fail with a transient error
    pub fn fail_creates(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Mark a provider-id as drifted
    pub fn mark_drifted(&self, provider_id: &str, reason: impl Into<String>) {
        self.drifted.insert(provider_id.to_string(), reason.into());
    }

    /// Number of `create` calls observed
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of live instances
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Insert an instance directly, bypassing `create` (an orphan for GC
    /// tests, or a pre-existing node)
    pub fn insert_instance(&self, claim: NodeClaim) {
        if let Some(provider_id) = claim.provider_id() {
            self.instances.insert(provider_id.to_string(), claim);
        }
    }
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    async fn get_instance_types(
        &self,
        _pool: Option<&gantry_common::crd::NodePool>,
    ) -> Result<Vec<InstanceType>, CloudProviderError> {
        Ok(self.catalog.read().expect("catalog lock").clone())
    }

    async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim, CloudProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CloudProviderError::Transient {
                message: "api throttled".to_string(),
            });
        }

        let requirements = Requirements::from_specs(&claim.spec.requirements);
        let mut candidates: Vec<InstanceType> = self
            .catalog
            .read()
            .expect("catalog lock")
            .iter()
            .filter(|it| {
                requirements
                    .get(INSTANCE_TYPE_LABEL)
                    .has(&it.name)
                    && it.cheapest_offering(&requirements).is_some()
            })
            .cloned()
            .collect();
        order_by_price(&mut candidates, &requirements);

        let Some(chosen) = candidates.first() else {
            return Err(CloudProviderError::Permanent {
                message: format!("no instance type satisfies {requirements}"),
            });
        };
        let offering = chosen
            .cheapest_offering(&requirements)
            .expect("filtered to types with a qualifying offering");

        if self.insufficient.contains_key(&(
            chosen.name.clone(),
            offering.zone.clone(),
            offering.capacity_type.clone(),
        )) {
            return Err(CloudProviderError::InsufficientCapacity {
                instance_type: chosen.name.clone(),
                zone: offering.zone.clone(),
                capacity_type: offering.capacity_type.clone(),
            });
        }

        let provider_id = format!("fake:///{}/{}", offering.zone, claim.name_any());
        let mut launched = claim.clone();
        let labels = launched.labels_mut();
        labels.insert(INSTANCE_TYPE_LABEL.to_string(), chosen.name.clone());
        labels.insert(ZONE_LABEL.to_string(), offering.zone.clone());
        labels.insert(
            CAPACITY_TYPE_LABEL.to_string(),
            offering.capacity_type.clone(),
        );
        launched.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        launched.status = Some(NodeClaimStatus {
            provider_id: Some(provider_id.clone()),
            image_id: Some("fake-image-1234".to_string()),
            capacity: chosen.capacity.clone(),
            allocatable: chosen.allocatable(),
            ..Default::default()
        });

        self.instances.insert(provider_id, launched.clone());
        Ok(launched)
    }

    async fn get(&self, provider_id: &str) -> Result<NodeClaim, CloudProviderError> {
        self.instances
            .get(provider_id)
            .map(|c| c.clone())
            .ok_or_else(|| CloudProviderError::NotFound {
                provider_id: provider_id.to_string(),
            })
    }

    async fn list(&self) -> Result<Vec<NodeClaim>, CloudProviderError> {
        Ok(self.instances.iter().map(|e| e.value().clone()).collect())
    }

    async fn delete(&self, claim: &NodeClaim) -> Result<(), CloudProviderError> {
        match claim.provider_id() {
            Some(provider_id) => {
                // idempotent on not-found
                self.instances.remove(provider_id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn is_drifted(
        &self,
        claim: &NodeClaim,
    ) -> Result<Option<DriftReason>, CloudProviderError> {
        Ok(claim
            .provider_id()
            .and_then(|id| self.drifted.get(id).map(|r| r.clone())))
    }
}

/// The default catalog: general purpose shapes in three zones, spot and
/// on-demand, plus accelerator and bare-metal shapes that stay deprioritized
pub fn default_catalog() -> Vec<InstanceType> {
    let mut catalog = Vec::new();
    for (name, cpu, memory_gi, od_price) in [
        ("t3.large", 2, 8, 0.08),
        ("m5.large", 2, 8, 0.10),
        ("m5.xlarge", 4, 16, 0.20),
        ("m5.2xlarge", 8, 32, 0.40),
        ("c5.xlarge", 4, 8, 0.17),
        ("inf1.2xlarge", 8, 16, 0.36),
        ("inf1.6xlarge", 24, 48, 1.18),
    ] {
        catalog.push(build_instance(name, cpu, memory_gi, od_price, &[]));
    }
    catalog.push(build_instance(
        "p4d.24xlarge",
        96,
        1152,
        32.77,
        &[("nvidia.com/gpu", 8)],
    ));
    catalog.push(build_instance("m5.metal", 96, 384, 4.61, &[]));
    catalog
}

/// Build one catalog entry with offerings in three zones
pub fn build_instance(
    name: &str,
    cpus: i64,
    memory_gi: i64,
    od_price: f64,
    extended: &[(&str, i64)],
) -> InstanceType {
    let mut capacity: ResourceList = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpus.to_string())),
        ("memory".to_string(), Quantity(format!("{memory_gi}Gi"))),
        ("ephemeral-storage".to_string(), Quantity("100Gi".into())),
        ("pods".to_string(), Quantity("110".into())),
    ]);
    for (resource, count) in extended {
        capacity.insert(resource.to_string(), quantity_from_millis(count * 1_000));
    }

    let mut offerings = Vec::new();
    for zone in ["zone-a", "zone-b", "zone-c"] {
        offerings.push(Offering {
            zone: zone.to_string(),
            capacity_type: ON_DEMAND.to_string(),
            price: od_price,
            available: true,
        });
        offerings.push(Offering {
            zone: zone.to_string(),
            capacity_type: SPOT.to_string(),
            price: od_price * 0.35,
            available: true,
        });
    }

    let derived = overhead::derive(&capacity, None);
    InstanceType {
        name: name.to_string(),
        requirements: standard_requirements(name, "amd64", &offerings),
        capacity,
        overhead: derived,
        offerings,
    }
}
