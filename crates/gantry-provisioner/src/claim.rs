//! The in-flight node claim the scheduler packs pods into
//!
//! An [`InFlightClaim`] starts from a template's base requirements and the
//! full instance-type catalog the pool permits. Every added pod narrows the
//! requirements and the instance-type options; finalization orders the
//! survivors by price and materializes the NodeClaim object.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

use gantry_cloud::instance_type::{order_by_price, InstanceType, ON_DEMAND, SPOT};
use gantry_common::crd::{NodeClaim, NodeClaimSpec, RequirementSpec, ResourceClaim};
use gantry_common::resources::{self, ResourceList};
use gantry_common::{
    CAPACITY_TYPE_LABEL, INSTANCE_TYPE_LABEL, NODEPOOL_HASH_ANNOTATION, TERMINATION_FINALIZER,
};
use gantry_scheduling::{
    pod_key, pod_requirements, taints, Operator, Requirement, Requirements, SchedulingError,
    Topology,
};
use gantry_state::HostPortUsage;

use crate::template::ClaimTemplate;

/// Upper bound on instance-type preferences handed to the cloud provider
pub const MAX_INSTANCE_TYPE_OPTIONS: usize = 60;

/// A not-yet-created claim being packed
#[derive(Clone, Debug)]
pub struct InFlightClaim {
    /// The template the claim was created from
    pub template: Arc<ClaimTemplate>,
    /// Requirements, narrowed as pods land
    pub requirements: Requirements,
    /// Instance types still able to host the claim
    pub instance_types: Vec<InstanceType>,
    /// Daemon overhead every option must absorb
    pub daemon_overhead: ResourceList,
    /// Aggregate requests: daemon overhead plus placed pods
    pub requests: ResourceList,
    /// Keys of the pods packed onto this claim
    pub pod_keys: Vec<String>,
    host_ports: HostPortUsage,
}

impl InFlightClaim {
    /// An empty claim for a template
    pub fn new(
        template: Arc<ClaimTemplate>,
        instance_types: Vec<InstanceType>,
        daemon_overhead: ResourceList,
    ) -> Self {
        let requirements = template.requirements.clone();
        Self {
            template,
            requirements,
            instance_types,
            daemon_overhead: daemon_overhead.clone(),
            requests: daemon_overhead,
            pod_keys: Vec::new(),
            host_ports: HostPortUsage::default(),
        }
    }

    /// Attempt to place a pod onto this claim
    ///
    /// `extra` carries requirements injected outside the pod spec (volume
    /// topology). On success the claim's requirements and instance types are
    /// narrowed and the topology tracker records the placement.
    pub fn add(
        &mut self,
        pod: &Pod,
        extra: &Requirements,
        topology: &mut Topology,
    ) -> Result<(), SchedulingError> {
        taints::tolerates(&self.template.all_taints(), pod)?;
        self.host_ports.validate(pod)?;

        let mut flexible = pod_requirements(pod, false);
        flexible.extend(extra);
        let surviving = flexible.compatible_terms(&self.requirements)?;

        let mut narrowed = self.requirements.clone();
        narrowed.extend(&surviving.common_requirements());

        let topology_requirements = topology.add_requirements(pod, &narrowed)?;
        narrowed.intersects(&topology_requirements)?;
        narrowed.extend(&topology_requirements);

        let requests = resources::add(&self.requests, &resources::pod_requests(pod));
        let remaining = filter_instance_types(&self.instance_types, &narrowed, &requests)?;

        self.pod_keys.push(pod_key(pod));
        self.requests = requests;
        self.requirements = narrowed;
        self.instance_types = remaining;
        self.host_ports.add(&pod_key(pod), pod);
        topology.record(pod, &self.requirements);
        Ok(())
    }

    /// Narrow, order and truncate the instance-type options, then lock the
    /// preference list into the requirements
    pub fn finalize(&mut self) {
        // spot strictly cheaper than the cheapest on-demand wins the claim
        let capacity_types = self.requirements.get(CAPACITY_TYPE_LABEL);
        if capacity_types.has(SPOT) && capacity_types.has(ON_DEMAND) {
            let cheapest_od = self
                .instance_types
                .iter()
                .flat_map(|it| it.available_offerings(&self.requirements))
                .filter(|o| o.capacity_type == ON_DEMAND)
                .map(|o| o.price)
                .min_by(f64::total_cmp);
            if let Some(cheapest_od) = cheapest_od {
                let spot_types: Vec<InstanceType> = self
                    .instance_types
                    .iter()
                    .filter(|it| {
                        it.available_offerings(&self.requirements)
                            .iter()
                            .any(|o| o.capacity_type == SPOT && o.price < cheapest_od)
                    })
                    .cloned()
                    .collect();
                if !spot_types.is_empty() {
                    self.instance_types = spot_types;
                    self.requirements
                        .add(Requirement::new(CAPACITY_TYPE_LABEL, Operator::In, [SPOT]));
                }
            }
        }

        order_by_price(&mut self.instance_types, &self.requirements);
        self.instance_types.truncate(MAX_INSTANCE_TYPE_OPTIONS);
        self.requirements.add(Requirement::new(
            INSTANCE_TYPE_LABEL,
            Operator::In,
            self.instance_types
                .iter()
                .map(|it| it.name.clone())
                .collect::<Vec<_>>(),
        ));
    }

    /// Materialize the NodeClaim object for the desired-state store
    pub fn to_node_claim(&self) -> NodeClaim {
        let mut labels = self.template.labels.clone();
        labels.extend(self.requirements.labels());

        let mut annotations = self.template.annotations.clone();
        annotations.insert(
            NODEPOOL_HASH_ANNOTATION.to_string(),
            self.template.template_hash.clone(),
        );

        let requirements: Vec<RequirementSpec> = self.requirements.to_specs();

        let mut claim = NodeClaim::new(
            "",
            NodeClaimSpec {
                requirements,
                resources: Some(ResourceClaim {
                    requests: self.requests.clone(),
                }),
                node_class_ref: self.template.node_class_ref.clone(),
                taints: self.template.taints.clone(),
                startup_taints: self.template.startup_taints.clone(),
                kubelet: self.template.kubelet.clone(),
            },
        );
        claim.metadata.name = None;
        claim.metadata.generate_name = Some(format!("{}-", self.template.pool_name));
        claim.metadata.labels = Some(labels);
        claim.metadata.annotations = Some(annotations);
        claim.metadata.finalizers = Some(vec![TERMINATION_FINALIZER.to_string()]);
        claim
    }

    /// Cheapest hourly price this claim could launch at
    pub fn price(&self) -> Option<f64> {
        self.instance_types
            .iter()
            .filter_map(|it| it.cheapest_offering(&self.requirements))
            .map(|o| o.price)
            .min_by(f64::total_cmp)
    }

    /// Number of pods packed so far
    pub fn pod_count(&self) -> usize {
        self.pod_keys.len()
    }
}

/// Keep instance types whose requirements intersect and whose allocatable
/// fits the aggregate requests
fn filter_instance_types(
    instance_types: &[InstanceType],
    requirements: &Requirements,
    requests: &ResourceList,
) -> Result<Vec<InstanceType>, SchedulingError> {
    let mut compatible_exists = false;
    let remaining: Vec<InstanceType> = instance_types
        .iter()
        .filter(|it| {
            let compatible = requirements.intersects(&it.requirements).is_ok()
                && it.cheapest_offering(requirements).is_some();
            compatible_exists |= compatible;
            compatible && resources::fits(requests, &it.allocatable())
        })
        .cloned()
        .collect();
    if remaining.is_empty() {
        // distinguish "nothing fits" from "nothing compatible" in the reason
        if compatible_exists {
            let first_short = requests
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| "resources".to_string());
            return Err(SchedulingError::ExceedsResources {
                resource: first_short,
            });
        }
        return Err(SchedulingError::NoCompatibleTerms);
    }
    Ok(remaining)
}
