//! Overhead derivation for a (instance type, kubelet configuration) pair
//!
//! The reservations follow the kubelet's documented defaults: a flat
//! system-reserved slice, a pod-count-driven kube-reserved memory formula
//! with a piecewise CPU curve, and hard/soft eviction thresholds where
//! percentages resolve against the instance's capacity.

use std::collections::BTreeMap;

use gantry_common::crd::KubeletConfiguration;
use gantry_common::resources::{self, quantity_from_millis, ResourceList};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::instance_type::Overhead;

const MEMORY_AVAILABLE_SIGNAL: &str = "memory.available";
const NODEFS_AVAILABLE_SIGNAL: &str = "nodefs.available";

/// Derive the full overhead for an instance's capacity under a kubelet config
///
/// Admission has already validated every override, so the derivation itself
/// cannot partially fail.
pub fn derive(capacity: &ResourceList, kubelet: Option<&KubeletConfiguration>) -> Overhead {
    let pods = capacity
        .get(resources::PODS)
        .map(resources::millis)
        .unwrap_or(0)
        / 1_000;
    let cpu_millis = capacity
        .get(resources::CPU)
        .map(resources::millis)
        .unwrap_or(0);

    let empty = BTreeMap::new();
    let (system_overrides, kube_overrides, hard_overrides, soft_overrides) = match kubelet {
        Some(k) => (
            &k.system_reserved,
            &k.kube_reserved,
            &k.eviction_hard,
            &k.eviction_soft,
        ),
        None => (&empty, &empty, &empty, &empty),
    };

    Overhead {
        system_reserved: system_reserved(system_overrides),
        kube_reserved: kube_reserved(pods, cpu_millis, kube_overrides),
        eviction_threshold: eviction_threshold(capacity, hard_overrides, soft_overrides),
    }
}

/// Adjust the pods entry of a capacity vector for kubelet pod ceilings
///
/// `pods = min(intrinsic ceiling, maxPods if set, podsPerCore × vcpus if > 0)`
pub fn apply_pods_ceiling(capacity: &mut ResourceList, kubelet: Option<&KubeletConfiguration>) {
    let Some(kubelet) = kubelet else { return };
    let intrinsic = capacity
        .get(resources::PODS)
        .map(resources::millis)
        .unwrap_or(0)
        / 1_000;
    let vcpus = capacity
        .get(resources::CPU)
        .map(resources::millis)
        .unwrap_or(0)
        / 1_000;

    let mut pods = intrinsic;
    if let Some(max_pods) = kubelet.max_pods {
        pods = pods.min(max_pods);
    }
    if let Some(per_core) = kubelet.pods_per_core {
        if per_core > 0 {
            pods = pods.min(per_core * vcpus);
        }
    }
    capacity.insert(resources::PODS.to_string(), Quantity(pods.to_string()));
}

/// Default system-reserved resources, right-biased with overrides
fn system_reserved(overrides: &BTreeMap<String, String>) -> ResourceList {
    let defaults: ResourceList = [
        (resources::CPU.to_string(), Quantity("100m".into())),
        (resources::MEMORY.to_string(), Quantity("100Mi".into())),
        (
            resources::EPHEMERAL_STORAGE.to_string(),
            Quantity("1Gi".into()),
        ),
    ]
    .into();
    resources::merge(&defaults, &to_resource_list(overrides))
}

/// Kube-reserved resources from pod count and CPU size, right-biased with
/// overrides
///
/// memory = 11·pods + 255 Mi; cpu = 6% of the first core, 1% of the second,
/// 0.5% of cores three and four, 0.25% of the rest.
fn kube_reserved(pods: i64, cpu_millis: i64, overrides: &BTreeMap<String, String>) -> ResourceList {
    let mut defaults: ResourceList = [
        (
            resources::MEMORY.to_string(),
            Quantity(format!("{}Mi", 11 * pods + 255)),
        ),
        (
            resources::EPHEMERAL_STORAGE.to_string(),
            Quantity("1Gi".into()),
        ),
    ]
    .into();

    let ranges: [(i64, i64, f64); 4] = [
        (0, 1_000, 0.06),
        (1_000, 2_000, 0.01),
        (2_000, 4_000, 0.005),
        (4_000, i64::MAX, 0.0025),
    ];
    let mut cpu_overhead = 0i64;
    for (start, end, percentage) in ranges {
        if cpu_millis > start {
            let span = (cpu_millis.min(end) - start) as f64;
            cpu_overhead += (span * percentage) as i64;
        }
    }
    defaults.insert(resources::CPU.to_string(), quantity_from_millis(cpu_overhead));

    resources::merge(&defaults, &to_resource_list(overrides))
}

/// Effective eviction threshold: element-wise max of hard and soft
fn eviction_threshold(
    capacity: &ResourceList,
    hard_overrides: &BTreeMap<String, String>,
    soft_overrides: &BTreeMap<String, String>,
) -> ResourceList {
    let memory_capacity = capacity
        .get(resources::MEMORY)
        .map(resources::millis)
        .unwrap_or(0);
    let storage_capacity = capacity
        .get(resources::EPHEMERAL_STORAGE)
        .map(resources::millis)
        .unwrap_or(0);

    // hard defaults: 100Mi of memory, 10% of node storage
    let mut hard: ResourceList = [
        (resources::MEMORY.to_string(), Quantity("100Mi".into())),
        (
            resources::EPHEMERAL_STORAGE.to_string(),
            quantity_from_millis(compute_threshold(storage_capacity, "10%")),
        ),
    ]
    .into();
    apply_signals(&mut hard, hard_overrides, memory_capacity, storage_capacity);

    // soft has no defaults; only configured signals contribute
    let mut soft = ResourceList::new();
    apply_signals(&mut soft, soft_overrides, memory_capacity, storage_capacity);

    resources::element_max([&hard, &soft])
}

/// Replace the default for each configured signal
fn apply_signals(
    thresholds: &mut ResourceList,
    overrides: &BTreeMap<String, String>,
    memory_capacity: i64,
    storage_capacity: i64,
) {
    for (signal, value) in overrides {
        match signal.as_str() {
            MEMORY_AVAILABLE_SIGNAL => {
                thresholds.insert(
                    resources::MEMORY.to_string(),
                    quantity_from_millis(compute_threshold(memory_capacity, value)),
                );
            }
            NODEFS_AVAILABLE_SIGNAL => {
                thresholds.insert(
                    resources::EPHEMERAL_STORAGE.to_string(),
                    quantity_from_millis(compute_threshold(storage_capacity, value)),
                );
            }
            // other kubelet signals (imagefs, pid) do not affect capacity
            _ => {}
        }
    }
}

/// Resolve one threshold value against a capacity
///
/// Percentages are ⌈capacity · p / 100⌉ with 100% meaning the threshold is
/// disabled; anything else parses as an absolute quantity. Validation at
/// admission guarantees the parse cannot fail here.
fn compute_threshold(capacity_millis: i64, value: &str) -> i64 {
    if let Some(pct) = value.strip_suffix('%') {
        let p: f64 = pct.parse().unwrap_or(0.0);
        if p == 100.0 {
            return 0;
        }
        let base_units = capacity_millis as f64 / 1_000.0;
        return (base_units / 100.0 * p).ceil() as i64 * 1_000;
    }
    resources::parse_quantity(value).unwrap_or(0)
}

fn to_resource_list(map: &BTreeMap<String, String>) -> ResourceList {
    map.iter()
        .map(|(k, v)| (k.clone(), Quantity(v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_common::resources::{millis, parse_quantity};

    fn capacity(cpu: &str, memory: &str, storage: &str, pods: &str) -> ResourceList {
        [
            (resources::CPU.to_string(), Quantity(cpu.into())),
            (resources::MEMORY.to_string(), Quantity(memory.into())),
            (
                resources::EPHEMERAL_STORAGE.to_string(),
                Quantity(storage.into()),
            ),
            (resources::PODS.to_string(), Quantity(pods.into())),
        ]
        .into()
    }

    #[test]
    fn kube_reserved_formula_at_110_pods_2_cpus() {
        let overhead = derive(&capacity("2", "8Gi", "100Gi", "110"), None);
        // memory = 11·110 + 255 = 1465Mi
        assert_eq!(
            millis(&overhead.kube_reserved[resources::MEMORY]),
            parse_quantity("1465Mi").unwrap()
        );
        // cpu = 1000·6% + 1000·1% = 70m
        assert_eq!(millis(&overhead.kube_reserved[resources::CPU]), 70);
    }

    #[test]
    fn kube_reserved_cpu_curve_covers_all_ranges() {
        // 8 cpus: 60 + 10 + 2000·0.5% + 4000·0.25% = 60+10+10+10 = 90m
        let overhead = derive(&capacity("8", "32Gi", "100Gi", "234"), None);
        assert_eq!(millis(&overhead.kube_reserved[resources::CPU]), 90);
    }

    #[test]
    fn system_reserved_defaults_merge_right_biased() {
        let kubelet = KubeletConfiguration {
            system_reserved: BTreeMap::from([("cpu".to_string(), "250m".to_string())]),
            ..Default::default()
        };
        let overhead = derive(&capacity("2", "8Gi", "100Gi", "110"), Some(&kubelet));
        assert_eq!(millis(&overhead.system_reserved[resources::CPU]), 250);
        assert_eq!(
            millis(&overhead.system_reserved[resources::MEMORY]),
            parse_quantity("100Mi").unwrap()
        );
    }

    #[test]
    fn eviction_hard_percentage_of_memory() {
        let kubelet = KubeletConfiguration {
            eviction_hard: BTreeMap::from([(
                MEMORY_AVAILABLE_SIGNAL.to_string(),
                "10%".to_string(),
            )]),
            ..Default::default()
        };
        let overhead = derive(&capacity("2", "8Gi", "100Gi", "110"), Some(&kubelet));
        // ⌈8589934592 · 0.1⌉ = 858993460 bytes
        assert_eq!(
            millis(&overhead.eviction_threshold[resources::MEMORY]),
            858_993_460_000
        );
    }

    #[test]
    fn eviction_threshold_100_percent_is_disabled() {
        let kubelet = KubeletConfiguration {
            eviction_hard: BTreeMap::from([
                (MEMORY_AVAILABLE_SIGNAL.to_string(), "100%".to_string()),
                (NODEFS_AVAILABLE_SIGNAL.to_string(), "100%".to_string()),
            ]),
            ..Default::default()
        };
        let overhead = derive(&capacity("2", "8Gi", "100Gi", "110"), Some(&kubelet));
        assert_eq!(millis(&overhead.eviction_threshold[resources::MEMORY]), 0);
        assert_eq!(
            millis(&overhead.eviction_threshold[resources::EPHEMERAL_STORAGE]),
            0
        );
    }

    #[test]
    fn greater_of_soft_and_hard_wins() {
        // soft 10% of 16Gi = 1.6Gi beats hard 1Gi
        let kubelet = KubeletConfiguration {
            eviction_hard: BTreeMap::from([(
                MEMORY_AVAILABLE_SIGNAL.to_string(),
                "1Gi".to_string(),
            )]),
            eviction_soft: BTreeMap::from([(
                MEMORY_AVAILABLE_SIGNAL.to_string(),
                "10%".to_string(),
            )]),
            ..Default::default()
        };
        let overhead = derive(&capacity("4", "16Gi", "100Gi", "110"), Some(&kubelet));
        let expected = ((16.0 * 1024.0 * 1024.0 * 1024.0) / 10.0_f64).ceil() as i64 * 1_000;
        assert_eq!(
            millis(&overhead.eviction_threshold[resources::MEMORY]),
            expected
        );
        assert!(expected > parse_quantity("1Gi").unwrap());
    }

    #[test]
    fn default_nodefs_eviction_is_ten_percent() {
        let overhead = derive(&capacity("2", "8Gi", "100Gi", "110"), None);
        let expected = compute_threshold(parse_quantity("100Gi").unwrap(), "10%");
        assert_eq!(
            millis(&overhead.eviction_threshold[resources::EPHEMERAL_STORAGE]),
            expected
        );
        assert!(expected > 0);
    }

    #[test]
    fn pods_ceiling_takes_the_minimum() {
        let mut c = capacity("8", "32Gi", "100Gi", "234");
        apply_pods_ceiling(
            &mut c,
            Some(&KubeletConfiguration {
                max_pods: Some(10),
                ..Default::default()
            }),
        );
        assert_eq!(millis(&c[resources::PODS]) / 1_000, 10);

        let mut c = capacity("8", "32Gi", "100Gi", "234");
        apply_pods_ceiling(
            &mut c,
            Some(&KubeletConfiguration {
                max_pods: Some(20),
                pods_per_core: Some(4),
                ..Default::default()
            }),
        );
        // min(intrinsic 234, maxPods 20, 4·8=32) = 20
        assert_eq!(millis(&c[resources::PODS]) / 1_000, 20);

        // podsPerCore = 0 disables the per-core cap
        let mut c = capacity("8", "32Gi", "100Gi", "234");
        apply_pods_ceiling(
            &mut c,
            Some(&KubeletConfiguration {
                pods_per_core: Some(0),
                ..Default::default()
            }),
        );
        assert_eq!(millis(&c[resources::PODS]) / 1_000, 234);
    }
}
