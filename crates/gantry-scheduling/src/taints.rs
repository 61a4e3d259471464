//! Taint toleration checks and taint merging

use k8s_openapi::api::core::v1::{Pod, Taint, Toleration};

use gantry_common::crd::TaintSpec;

use crate::error::SchedulingError;

/// Convert CRD taints into the upstream representation
pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a TaintSpec>) -> Vec<Taint> {
    specs
        .into_iter()
        .map(|t| Taint {
            key: t.key.clone(),
            value: t.value.clone(),
            effect: t.effect.clone(),
            time_added: None,
        })
        .collect()
}

/// Check that the pod tolerates every scheduling-relevant taint
///
/// PreferNoSchedule taints never block placement. The first untolerated
/// taint is returned as the pod's reason.
pub fn tolerates(taints: &[Taint], pod: &Pod) -> Result<(), SchedulingError> {
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.as_deref())
        .unwrap_or(&[]);
    for taint in taints {
        if taint.effect == "PreferNoSchedule" {
            continue;
        }
        if !tolerations.iter().any(|t| tolerates_taint(t, taint)) {
            return Err(SchedulingError::UntoleratedTaint {
                key: taint.key.clone(),
                value: taint.value.clone().unwrap_or_default(),
                effect: taint.effect.clone(),
            });
        }
    }
    Ok(())
}

fn tolerates_taint(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    match toleration.operator.as_deref() {
        Some("Exists") => match toleration.key.as_deref() {
            // an empty key with Exists tolerates everything
            None | Some("") => true,
            Some(key) => key == taint.key,
        },
        // default operator is Equal
        _ => {
            toleration.key.as_deref() == Some(taint.key.as_str())
                && toleration.value.clone().unwrap_or_default()
                    == taint.value.clone().unwrap_or_default()
        }
    }
}

/// Merge taints, with incoming taints winning on (key, effect) collisions
pub fn merge(existing: &[Taint], incoming: &[Taint]) -> Vec<Taint> {
    let mut merged: Vec<Taint> = existing
        .iter()
        .filter(|e| {
            !incoming
                .iter()
                .any(|i| i.key == e.key && i.effect == e.effect)
        })
        .cloned()
        .collect();
    merged.extend(incoming.iter().cloned());
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;

    fn taint(key: &str, value: &str, effect: &str) -> Taint {
        Taint {
            key: key.into(),
            value: (!value.is_empty()).then(|| value.to_string()),
            effect: effect.into(),
            time_added: None,
        }
    }

    fn pod_with_tolerations(tolerations: Vec<Toleration>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                tolerations: Some(tolerations),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn untolerated_no_schedule_taint_blocks() {
        let taints = vec![taint("dedicated", "gpu", "NoSchedule")];
        let pod = pod_with_tolerations(vec![]);
        let err = tolerates(&taints, &pod).unwrap_err();
        assert!(matches!(err, SchedulingError::UntoleratedTaint { key, .. } if key == "dedicated"));
    }

    #[test]
    fn equal_toleration_matches_key_and_value() {
        let taints = vec![taint("dedicated", "gpu", "NoSchedule")];
        let pod = pod_with_tolerations(vec![Toleration {
            key: Some("dedicated".into()),
            operator: Some("Equal".into()),
            value: Some("gpu".into()),
            effect: Some("NoSchedule".into()),
            ..Default::default()
        }]);
        assert!(tolerates(&taints, &pod).is_ok());

        let wrong_value = pod_with_tolerations(vec![Toleration {
            key: Some("dedicated".into()),
            operator: Some("Equal".into()),
            value: Some("batch".into()),
            ..Default::default()
        }]);
        assert!(tolerates(&taints, &wrong_value).is_err());
    }

    #[test]
    fn exists_toleration_with_empty_key_tolerates_all() {
        let taints = vec![
            taint("dedicated", "gpu", "NoSchedule"),
            taint("zone-maintenance", "", "NoExecute"),
        ];
        let pod = pod_with_tolerations(vec![Toleration {
            operator: Some("Exists".into()),
            ..Default::default()
        }]);
        assert!(tolerates(&taints, &pod).is_ok());
    }

    #[test]
    fn prefer_no_schedule_never_blocks() {
        let taints = vec![taint("soft-isolation", "", "PreferNoSchedule")];
        assert!(tolerates(&taints, &pod_with_tolerations(vec![])).is_ok());
    }

    #[test]
    fn merge_replaces_on_key_and_effect() {
        let existing = vec![taint("dedicated", "gpu", "NoSchedule"), taint("a", "", "NoExecute")];
        let incoming = vec![taint("dedicated", "batch", "NoSchedule")];
        let merged = merge(&existing, &incoming);
        assert_eq!(merged.len(), 2);
        let dedicated = merged.iter().find(|t| t.key == "dedicated").unwrap();
        assert_eq!(dedicated.value.as_deref(), Some("batch"));
    }
}
