//! Volume topology resolution
//!
//! Persistent volume claims pin pods to the topology of their storage. Before
//! scheduling, each pod's claims are resolved to the zones the bound volume
//! lives in (or the zones an unbound claim's storage class may provision
//! into), and the result is injected into the pod's node requirements.

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;

use crate::error::SchedulingError;
use crate::requirement::{Operator, Requirement};
use crate::requirements::Requirements;

/// Resolve the node requirements imposed by a pod's persistent volume claims
///
/// `pvcs`, `pvs` and `storage_classes` are the listed cluster objects; the
/// caller fetches them once per scheduling pass.
pub fn volume_requirements(
    pod: &Pod,
    pvcs: &[PersistentVolumeClaim],
    pvs: &[PersistentVolume],
    storage_classes: &[StorageClass],
) -> Result<Requirements, SchedulingError> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let mut requirements = Requirements::new();

    for volume in pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_deref())
        .unwrap_or(&[])
    {
        let Some(claim_ref) = &volume.persistent_volume_claim else {
            continue;
        };
        let claim = pvcs
            .iter()
            .find(|pvc| {
                pvc.metadata.name.as_deref() == Some(claim_ref.claim_name.as_str())
                    && pvc.metadata.namespace.as_deref().unwrap_or("default") == namespace
            })
            .ok_or_else(|| SchedulingError::VolumeResolution {
                volume: volume.name.clone(),
                message: format!("claim {} not found", claim_ref.claim_name),
            })?;

        match claim.spec.as_ref().and_then(|s| s.volume_name.as_deref()) {
            // bound claim: follow the volume's node affinity
            Some(volume_name) => {
                let pv = pvs
                    .iter()
                    .find(|pv| pv.metadata.name.as_deref() == Some(volume_name))
                    .ok_or_else(|| SchedulingError::VolumeResolution {
                        volume: volume.name.clone(),
                        message: format!("bound volume {volume_name} not found"),
                    })?;
                for requirement in bound_volume_requirements(pv) {
                    requirements.add(requirement);
                }
            }
            // unbound claim: the storage class decides where it can land
            None => {
                let Some(class_name) = claim
                    .spec
                    .as_ref()
                    .and_then(|s| s.storage_class_name.as_deref())
                else {
                    continue;
                };
                let Some(class) = storage_classes
                    .iter()
                    .find(|sc| sc.metadata.name.as_deref() == Some(class_name))
                else {
                    continue;
                };
                for requirement in class_requirements(class) {
                    requirements.add(requirement);
                }
            }
        }
    }
    Ok(requirements)
}

/// Topology requirements of a bound persistent volume
///
/// Volumes carry at most one node-selector term in practice; the first term
/// is authoritative.
fn bound_volume_requirements(pv: &PersistentVolume) -> Vec<Requirement> {
    pv.spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|na| na.required.as_ref())
        .and_then(|r| r.node_selector_terms.first())
        .map(|term| {
            term.match_expressions
                .iter()
                .flatten()
                .filter(|expr| expr.operator == "In")
                .map(|expr| {
                    Requirement::new(
                        expr.key.clone(),
                        Operator::In,
                        expr.values.clone().unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Topology requirements allowed by a storage class
fn class_requirements(class: &StorageClass) -> Vec<Requirement> {
    class
        .allowed_topologies
        .iter()
        .flatten()
        .take(1)
        .flat_map(|term| term.match_label_expressions.iter().flatten())
        .map(|expr| Requirement::new(expr.key.clone(), Operator::In, expr.values.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PersistentVolumeClaimSpec,
        PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodSpec, Volume,
        VolumeNodeAffinity,
    };
    use k8s_openapi::api::core::v1::{TopologySelectorLabelRequirement, TopologySelectorTerm};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const ZONE: &str = "topology.kubernetes.io/zone";

    fn pod_with_claim(claim: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("db-0".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "data".into(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn claim(name: &str, volume: Option<&str>, class: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: volume.map(String::from),
                storage_class_name: class.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn zonal_pv(name: &str, zone: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                node_affinity: Some(VolumeNodeAffinity {
                    required: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: Some(vec![NodeSelectorRequirement {
                                key: ZONE.into(),
                                operator: "In".into(),
                                values: Some(vec![zone.into()]),
                            }]),
                            ..Default::default()
                        }],
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn bound_claim_pins_pod_to_volume_zone() {
        let requirements = volume_requirements(
            &pod_with_claim("data-db-0"),
            &[claim("data-db-0", Some("pv-1"), None)],
            &[zonal_pv("pv-1", "zone-b")],
            &[],
        )
        .unwrap();
        assert_eq!(requirements.get(ZONE).single_value(), Some("zone-b"));
    }

    #[test]
    fn unbound_claim_follows_storage_class_topologies() {
        let class = StorageClass {
            metadata: ObjectMeta {
                name: Some("zonal-ssd".into()),
                ..Default::default()
            },
            allowed_topologies: Some(vec![TopologySelectorTerm {
                match_label_expressions: Some(vec![TopologySelectorLabelRequirement {
                    key: ZONE.into(),
                    values: vec!["zone-a".into(), "zone-b".into()],
                }]),
            }]),
            ..Default::default()
        };
        let requirements = volume_requirements(
            &pod_with_claim("data-db-0"),
            &[claim("data-db-0", None, Some("zonal-ssd"))],
            &[],
            &[class],
        )
        .unwrap();
        assert_eq!(requirements.get(ZONE).count(), Some(2));
    }

    #[test]
    fn missing_claim_is_an_error() {
        let err = volume_requirements(&pod_with_claim("data-db-0"), &[], &[], &[]).unwrap_err();
        assert!(matches!(err, SchedulingError::VolumeResolution { .. }));
    }

    #[test]
    fn unbound_claim_without_class_is_unconstrained() {
        let requirements = volume_requirements(
            &pod_with_claim("data-db-0"),
            &[claim("data-db-0", None, None)],
            &[],
            &[],
        )
        .unwrap();
        assert!(!requirements.has(ZONE));
    }
}
