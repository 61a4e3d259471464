//! Preference relaxation
//!
//! When a pod cannot schedule, its optional constraints are dropped one at a
//! time, heaviest class first: preferred node affinity, then ScheduleAnyway
//! topology spreads, then preferred pod affinity. The scheduler works on its
//! own copies of pod specs, so stripping terms here never touches the
//! objects in the store.

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

/// Drop the next relaxable constraint; false when nothing is left
pub fn relax(pod: &mut Pod) -> bool {
    relax_preferred_node_affinity(pod)
        || relax_schedule_anyway_spreads(pod)
        || relax_preferred_pod_affinity(pod)
}

fn relax_preferred_node_affinity(pod: &mut Pod) -> bool {
    let Some(preferred) = pod
        .spec
        .as_mut()
        .and_then(|s| s.affinity.as_mut())
        .and_then(|a| a.node_affinity.as_mut())
        .and_then(|na| na.preferred_during_scheduling_ignored_during_execution.as_mut())
    else {
        return false;
    };
    if preferred.is_empty() {
        return false;
    }
    // drop the heaviest term: it is the one currently being honored
    let heaviest = preferred
        .iter()
        .enumerate()
        .max_by_key(|(_, t)| t.weight)
        .map(|(i, _)| i)
        .expect("non-empty preference list");
    let dropped = preferred.remove(heaviest);
    debug!(
        pod = %name_of(pod),
        weight = dropped.weight,
        "Relaxed preferred node affinity term"
    );
    true
}

fn relax_schedule_anyway_spreads(pod: &mut Pod) -> bool {
    let pod_name = name_of(pod).to_string();
    let Some(constraints) = pod
        .spec
        .as_mut()
        .and_then(|s| s.topology_spread_constraints.as_mut())
    else {
        return false;
    };
    let before = constraints.len();
    constraints.retain(|c| c.when_unsatisfiable != "ScheduleAnyway");
    if constraints.len() < before {
        debug!(
            pod = %pod_name,
            dropped = before - constraints.len(),
            "Relaxed ScheduleAnyway topology spread constraints"
        );
        true
    } else {
        false
    }
}

fn relax_preferred_pod_affinity(pod: &mut Pod) -> bool {
    let Some(preferred) = pod
        .spec
        .as_mut()
        .and_then(|s| s.affinity.as_mut())
        .and_then(|a| a.pod_affinity.as_mut())
        .and_then(|pa| pa.preferred_during_scheduling_ignored_during_execution.as_mut())
    else {
        return false;
    };
    if preferred.is_empty() {
        return false;
    }
    let heaviest = preferred
        .iter()
        .enumerate()
        .max_by_key(|(_, t)| t.weight)
        .map(|(i, _)| i)
        .expect("non-empty preference list");
    let dropped = preferred.remove(heaviest);
    debug!(
        pod = %name_of(pod),
        weight = dropped.weight,
        "Relaxed preferred pod affinity term"
    );
    true
}

fn name_of(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("")
}
