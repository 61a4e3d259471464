//! Instance type model: capacity, overhead, offerings and requirements

use gantry_common::resources::{self, ResourceList};
use gantry_scheduling::{Operator, Requirement, Requirements};

use gantry_common::{CAPACITY_TYPE_LABEL, ZONE_LABEL};

/// Purchase option value for on-demand capacity
pub const ON_DEMAND: &str = "on-demand";
/// Purchase option value for spot capacity
pub const SPOT: &str = "spot";

/// One purchase option for an instance type
#[derive(Clone, Debug, PartialEq)]
pub struct Offering {
    /// Topology zone the offering launches into
    pub zone: String,
    /// Purchase option (on-demand, spot)
    pub capacity_type: String,
    /// Hourly price in the provider's pricing unit
    pub price: f64,
    /// Whether the provider currently reports the offering launchable
    pub available: bool,
}

impl Offering {
    /// True when this offering satisfies zone and capacity-type requirements
    pub fn matches(&self, requirements: &Requirements) -> bool {
        requirements.get(ZONE_LABEL).has(&self.zone)
            && requirements.get(CAPACITY_TYPE_LABEL).has(&self.capacity_type)
    }
}

/// Node overhead, split by source
///
/// The scheduler-facing total uses the element-wise max of hard and soft
/// eviction thresholds for each signal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Overhead {
    /// Reserved for the host OS and system daemons
    pub system_reserved: ResourceList,
    /// Reserved for the kubelet and container runtime
    pub kube_reserved: ResourceList,
    /// Effective eviction threshold (max of hard and soft per resource)
    pub eviction_threshold: ResourceList,
}

impl Overhead {
    /// Total overhead subtracted from capacity to produce allocatable
    pub fn total(&self) -> ResourceList {
        resources::add(
            &resources::add(&self.system_reserved, &self.kube_reserved),
            &self.eviction_threshold,
        )
    }
}

/// A launchable instance type with its offerings
#[derive(Clone, Debug)]
pub struct InstanceType {
    /// Provider-unique name (e.g. "m5.xlarge")
    pub name: String,
    /// Requirements this type satisfies (architecture, OS, zones,
    /// capacity types, instance-type label)
    pub requirements: Requirements,
    /// Raw capacity, including extended resources
    pub capacity: ResourceList,
    /// Derived overhead for the active kubelet configuration
    pub overhead: Overhead,
    /// Purchase options, one per (zone, capacity-type)
    pub offerings: Vec<Offering>,
}

impl InstanceType {
    /// Capacity minus overhead, clamped at zero per resource
    pub fn allocatable(&self) -> ResourceList {
        resources::subtract_clamped(&self.capacity, &self.overhead.total())
    }

    /// Offerings that are currently available and satisfy the requirements
    pub fn available_offerings(&self, requirements: &Requirements) -> Vec<&Offering> {
        self.offerings
            .iter()
            .filter(|o| o.available && o.matches(requirements))
            .collect()
    }

    /// Cheapest available offering satisfying the requirements
    pub fn cheapest_offering(&self, requirements: &Requirements) -> Option<&Offering> {
        self.available_offerings(requirements)
            .into_iter()
            .min_by(|a, b| a.price.total_cmp(&b.price))
    }

    /// True when this type is held back unless explicitly requested
    ///
    /// Accelerator-carrying and bare-metal shapes are expensive defaults;
    /// they stay out of the candidate set until a pod asks for them.
    pub fn is_deprioritized(&self) -> bool {
        let has_accelerator = self.capacity.iter().any(|(name, quantity)| {
            !matches!(name.as_str(), "cpu" | "memory" | "ephemeral-storage" | "pods")
                && resources::millis(quantity) > 0
        });
        has_accelerator || self.name.contains("metal")
    }
}

/// Order instance types by cheapest qualifying offering, then by name
///
/// This is the preference order handed to the cloud provider; determinism of
/// the tie-break is part of the scheduling contract.
pub fn order_by_price(types: &mut [InstanceType], requirements: &Requirements) {
    types.sort_by(|a, b| {
        let pa = a
            .cheapest_offering(requirements)
            .map(|o| o.price)
            .unwrap_or(f64::MAX);
        let pb = b
            .cheapest_offering(requirements)
            .map(|o| o.price)
            .unwrap_or(f64::MAX);
        pa.total_cmp(&pb).then_with(|| a.name.cmp(&b.name))
    });
}

/// Build the standard requirement set for an instance type
///
/// The provider supplies the architecture and OS; zones and capacity types
/// come from the offerings so requirement filtering and offering filtering
/// agree.
pub fn standard_requirements(name: &str, arch: &str, offerings: &[Offering]) -> Requirements {
    let mut requirements = Requirements::new();
    requirements.add(Requirement::new(
        gantry_common::INSTANCE_TYPE_LABEL,
        Operator::In,
        [name.to_string()],
    ));
    requirements.add(Requirement::new(
        gantry_common::ARCH_LABEL,
        Operator::In,
        [arch.to_string()],
    ));
    requirements.add(Requirement::new(
        gantry_common::OS_LABEL,
        Operator::In,
        ["linux".to_string()],
    ));
    requirements.add(Requirement::new(
        ZONE_LABEL,
        Operator::In,
        offerings.iter().map(|o| o.zone.clone()).collect::<Vec<_>>(),
    ));
    requirements.add(Requirement::new(
        CAPACITY_TYPE_LABEL,
        Operator::In,
        offerings
            .iter()
            .map(|o| o.capacity_type.clone())
            .collect::<Vec<_>>(),
    ));
    requirements
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn rl(entries: &[(&str, &str)]) -> ResourceList {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    fn instance(name: &str, offerings: Vec<Offering>) -> InstanceType {
        InstanceType {
            name: name.into(),
            requirements: standard_requirements(name, "amd64", &offerings),
            capacity: rl(&[("cpu", "4"), ("memory", "16Gi"), ("pods", "110")]),
            overhead: Overhead::default(),
            offerings,
        }
    }

    fn offering(zone: &str, capacity_type: &str, price: f64) -> Offering {
        Offering {
            zone: zone.into(),
            capacity_type: capacity_type.into(),
            price,
            available: true,
        }
    }

    #[test]
    fn allocatable_subtracts_overhead_clamped() {
        let mut it = instance("m5.xlarge", vec![offering("zone-a", ON_DEMAND, 0.2)]);
        it.overhead.system_reserved = rl(&[("cpu", "100m"), ("memory", "100Mi")]);
        it.overhead.kube_reserved = rl(&[("cpu", "80m")]);
        let alloc = it.allocatable();
        assert_eq!(resources::millis(&alloc["cpu"]), 4_000 - 180);

        // overhead larger than capacity clamps to zero
        it.overhead.kube_reserved = rl(&[("cpu", "100")]);
        assert_eq!(resources::millis(&it.allocatable()["cpu"]), 0);
    }

    #[test]
    fn cheapest_offering_respects_requirements() {
        let it = instance(
            "m5.xlarge",
            vec![
                offering("zone-a", SPOT, 0.06),
                offering("zone-a", ON_DEMAND, 0.2),
                offering("zone-b", ON_DEMAND, 0.19),
            ],
        );
        let mut od_only = Requirements::new();
        od_only.add(Requirement::new(
            CAPACITY_TYPE_LABEL,
            Operator::In,
            [ON_DEMAND],
        ));
        assert_eq!(it.cheapest_offering(&od_only).unwrap().price, 0.19);
        assert_eq!(it.cheapest_offering(&Requirements::new()).unwrap().price, 0.06);
    }

    #[test]
    fn unavailable_offerings_never_qualify() {
        let mut it = instance("m5.xlarge", vec![offering("zone-a", ON_DEMAND, 0.2)]);
        it.offerings[0].available = false;
        assert!(it.cheapest_offering(&Requirements::new()).is_none());
    }

    #[test]
    fn order_by_price_breaks_ties_by_name() {
        let mut types = vec![
            instance("m5.xlarge", vec![offering("zone-a", ON_DEMAND, 0.2)]),
            instance("c5.xlarge", vec![offering("zone-a", ON_DEMAND, 0.2)]),
            instance("t3.large", vec![offering("zone-a", ON_DEMAND, 0.08)]),
        ];
        order_by_price(&mut types, &Requirements::new());
        let names: Vec<&str> = types.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["t3.large", "c5.xlarge", "m5.xlarge"]);
    }

    #[test]
    fn accelerator_and_metal_shapes_are_deprioritized() {
        let mut gpu = instance("p4d.24xlarge", vec![offering("zone-a", ON_DEMAND, 32.0)]);
        gpu.capacity.insert("nvidia.com/gpu".into(), Quantity("8".into()));
        assert!(gpu.is_deprioritized());

        let metal = instance("m5.metal", vec![offering("zone-a", ON_DEMAND, 4.6)]);
        assert!(metal.is_deprioritized());

        let plain = instance("m5.xlarge", vec![offering("zone-a", ON_DEMAND, 0.2)]);
        assert!(!plain.is_deprioritized());
    }

    #[test]
    fn standard_requirements_cover_offering_dimensions() {
        let reqs = standard_requirements(
            "m5.xlarge",
            "amd64",
            &[offering("zone-a", ON_DEMAND, 0.2), offering("zone-b", SPOT, 0.07)],
        );
        assert!(reqs.get(ZONE_LABEL).has("zone-b"));
        assert!(reqs.get(CAPACITY_TYPE_LABEL).has(SPOT));
        assert_eq!(
            reqs.get(gantry_common::INSTANCE_TYPE_LABEL).single_value(),
            Some("m5.xlarge")
        );
    }
}
