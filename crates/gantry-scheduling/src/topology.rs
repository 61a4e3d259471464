//! Topology tracking for spread constraints and pod (anti-)affinity
//!
//! The tracker keeps one [`TopologyGroup`] per distinct (kind, topology key,
//! selector, namespaces) tuple. Groups count placed and running pods per
//! topology domain; the scheduler asks each relevant group for its
//! admissible domains and narrows the candidate's requirements with the
//! answer, then records the final placement back into the counts.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::error::SchedulingError;
use crate::requirement::{Operator, Requirement};
use crate::requirements::Requirements;

/// What a group tracks
#[derive(Clone, Debug, PartialEq)]
pub enum TopologyKind {
    /// A topology spread constraint with its skew tolerance
    Spread {
        /// Maximum allowed difference between the fullest and emptiest domain
        max_skew: i64,
    },
    /// Pods must land where selector-matching pods already run
    Affinity,
    /// Pods must avoid domains with selector-matching pods
    AntiAffinity,
}

/// Running counts for one topology constraint
#[derive(Clone, Debug)]
pub struct TopologyGroup {
    kind: TopologyKind,
    key: String,
    selector: Option<LabelSelector>,
    namespaces: BTreeSet<String>,
    domains: BTreeMap<String, usize>,
    owners: BTreeSet<String>,
}

impl TopologyGroup {
    fn new(
        kind: TopologyKind,
        key: impl Into<String>,
        selector: Option<LabelSelector>,
        namespaces: BTreeSet<String>,
    ) -> Self {
        Self {
            kind,
            key: key.into(),
            selector,
            namespaces,
            domains: BTreeMap::new(),
            owners: BTreeSet::new(),
        }
    }

    /// Topology key (e.g. `topology.kubernetes.io/zone`)
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identity used to merge equivalent constraints across pods
    fn identity(&self) -> String {
        format!(
            "{:?}/{}/{}/{:?}",
            self.kind,
            self.key,
            serde_json::to_string(&self.selector).unwrap_or_default(),
            self.namespaces
        )
    }

    /// Make a domain known to the group without counting anything
    pub fn register(&mut self, domain: &str) {
        self.domains.entry(domain.to_string()).or_insert(0);
    }

    fn increment(&mut self, domain: &str) {
        *self.domains.entry(domain.to_string()).or_insert(0) += 1;
    }

    /// True when the pod's labels and namespace fall under the selector
    fn counts_pod(&self, pod: &Pod) -> bool {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        if !self.namespaces.is_empty() && !self.namespaces.contains(namespace) {
            return false;
        }
        let empty = BTreeMap::new();
        let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
        selector_matches(self.selector.as_ref(), labels)
    }

    fn is_owned_by(&self, pod_key: &str) -> bool {
        self.owners.contains(pod_key)
    }

    /// Domains this group would admit the pod into
    fn admissible_domains(&self, pod: &Pod) -> Requirement {
        match &self.kind {
            TopologyKind::Spread { max_skew } => {
                let min = self.domains.values().min().copied().unwrap_or(0);
                let allowed: Vec<String> = self
                    .domains
                    .iter()
                    .filter(|(_, &count)| (count + 1) as i64 - min as i64 <= *max_skew)
                    .map(|(domain, _)| domain.clone())
                    .collect();
                Requirement::new(self.key.clone(), Operator::In, allowed)
            }
            TopologyKind::Affinity => {
                let occupied: Vec<String> = self
                    .domains
                    .iter()
                    .filter(|(_, &count)| count > 0)
                    .map(|(domain, _)| domain.clone())
                    .collect();
                if occupied.is_empty() && self.counts_pod(pod) {
                    // the first self-selecting pod may seed any domain
                    Requirement::new(self.key.clone(), Operator::Exists, Vec::<String>::new())
                } else {
                    Requirement::new(self.key.clone(), Operator::In, occupied)
                }
            }
            TopologyKind::AntiAffinity => {
                let poisoned: Vec<String> = self
                    .domains
                    .iter()
                    .filter(|(_, &count)| count > 0)
                    .map(|(domain, _)| domain.clone())
                    .collect();
                Requirement::new(self.key.clone(), Operator::NotIn, poisoned)
            }
        }
    }

    /// Whether placing this pod must update the group's counts
    fn records_pod(&self, pod: &Pod, pod_key: &str) -> bool {
        self.counts_pod(pod)
            || (matches!(self.kind, TopologyKind::AntiAffinity) && self.is_owned_by(pod_key))
    }

    /// Whether the group's constraint applies when placing this pod
    fn constrains_pod(&self, pod: &Pod, pod_key: &str) -> bool {
        match self.kind {
            TopologyKind::Spread { .. } => self.is_owned_by(pod_key),
            TopologyKind::Affinity => self.is_owned_by(pod_key),
            // anti-affinity blocks its owners and, inversely, any pod the
            // owners selected against
            TopologyKind::AntiAffinity => self.is_owned_by(pod_key) || self.counts_pod(pod),
        }
    }
}

/// Tracker over all topology groups relevant to a scheduling pass
#[derive(Clone, Debug, Default)]
pub struct Topology {
    groups: BTreeMap<String, TopologyGroup>,
}

/// Stable identity of a pod for ownership tracking
pub fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or("")
    )
}

impl Topology {
    /// An empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the pod's constraints, creating or joining groups
    ///
    /// Safe to call repeatedly: after preference relaxation, call again (via
    /// [`Topology::update`]) and the pod joins only the constraints that
    /// survived.
    pub fn track(&mut self, pod: &Pod) {
        let key = pod_key(pod);
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");

        for constraint in pod
            .spec
            .as_ref()
            .and_then(|s| s.topology_spread_constraints.as_deref())
            .unwrap_or(&[])
        {
            self.join(
                TopologyGroup::new(
                    TopologyKind::Spread {
                        max_skew: constraint.max_skew as i64,
                    },
                    constraint.topology_key.clone(),
                    constraint.label_selector.clone(),
                    [namespace.to_string()].into(),
                ),
                &key,
            );
        }

        let affinity = pod.spec.as_ref().and_then(|s| s.affinity.as_ref());
        for term in affinity
            .and_then(|a| a.pod_affinity.as_ref())
            .and_then(|pa| pa.required_during_scheduling_ignored_during_execution.as_deref())
            .unwrap_or(&[])
        {
            self.join(
                TopologyGroup::new(
                    TopologyKind::Affinity,
                    term.topology_key.clone(),
                    term.label_selector.clone(),
                    term_namespaces(namespace, term.namespaces.as_deref()),
                ),
                &key,
            );
        }
        // the heaviest preferred affinity term is treated as required until
        // the relaxation loop strips it from the pod spec
        if let Some(preferred) = affinity
            .and_then(|a| a.pod_affinity.as_ref())
            .and_then(|pa| pa.preferred_during_scheduling_ignored_during_execution.as_deref())
        {
            if let Some(heaviest) = preferred.iter().max_by_key(|t| t.weight) {
                let term = &heaviest.pod_affinity_term;
                self.join(
                    TopologyGroup::new(
                        TopologyKind::Affinity,
                        term.topology_key.clone(),
                        term.label_selector.clone(),
                        term_namespaces(namespace, term.namespaces.as_deref()),
                    ),
                    &key,
                );
            }
        }
        for term in affinity
            .and_then(|a| a.pod_anti_affinity.as_ref())
            .and_then(|pa| pa.required_during_scheduling_ignored_during_execution.as_deref())
            .unwrap_or(&[])
        {
            self.join(
                TopologyGroup::new(
                    TopologyKind::AntiAffinity,
                    term.topology_key.clone(),
                    term.label_selector.clone(),
                    term_namespaces(namespace, term.namespaces.as_deref()),
                ),
                &key,
            );
        }
    }

    fn join(&mut self, group: TopologyGroup, owner: &str) {
        let entry = self
            .groups
            .entry(group.identity())
            .or_insert(group);
        entry.owners.insert(owner.to_string());
    }

    /// Re-evaluate a pod's constraints after relaxation
    ///
    /// Ownership of groups whose constraint was stripped from the pod spec is
    /// released; counts are preserved since other pods may share the group.
    pub fn update(&mut self, pod: &Pod) {
        let key = pod_key(pod);
        for group in self.groups.values_mut() {
            group.owners.remove(&key);
        }
        self.track(pod);
    }

    /// Pre-register the domains a template or node can produce for a key
    pub fn register(&mut self, key: &str, domain: &str) {
        for group in self.groups.values_mut() {
            if group.key == key {
                group.register(domain);
            }
        }
    }

    /// Count an already-running pod into every group that selects it
    ///
    /// `node_labels` provides the domain values of the node the pod runs on.
    pub fn count_running(&mut self, pod: &Pod, node_labels: &BTreeMap<String, String>) {
        for group in self.groups.values_mut() {
            if !group.counts_pod(pod) {
                continue;
            }
            if let Some(domain) = node_labels.get(&group.key) {
                let domain = domain.clone();
                group.increment(&domain);
            }
        }
    }

    /// Admissible-domain requirements for placing `pod` on a candidate
    ///
    /// The candidate's current requirements bound which domains are actually
    /// reachable; a group whose admissible set cannot intersect them fails
    /// the placement.
    pub fn add_requirements(
        &self,
        pod: &Pod,
        candidate: &Requirements,
    ) -> Result<Requirements, SchedulingError> {
        let key = pod_key(pod);
        let mut narrowed = Requirements::new();
        for group in self.groups.values() {
            if !group.constrains_pod(pod, &key) {
                continue;
            }
            let admissible = group.admissible_domains(pod);
            let existing = candidate.get(group.key());
            if !existing.intersects(&admissible) {
                return Err(SchedulingError::NoTopologyDomains {
                    key: group.key().to_string(),
                });
            }
            narrowed.add(admissible);
        }
        Ok(narrowed)
    }

    /// Record a successful placement into the counts
    ///
    /// The chosen requirements are the candidate's post-narrowing view; when
    /// a key is still flexible the emptiest admissible domain is charged, as
    /// that is the domain a skew-respecting placement lands in.
    pub fn record(&mut self, pod: &Pod, chosen: &Requirements) {
        let key = pod_key(pod);
        for group in self.groups.values_mut() {
            if !group.records_pod(pod, &key) {
                continue;
            }
            let requirement = chosen.get(&group.key);
            let domain = if let Some(single) = requirement.single_value() {
                Some(single.to_string())
            } else {
                group
                    .domains
                    .iter()
                    .filter(|(domain, _)| requirement.has(domain))
                    .min_by_key(|(domain, &count)| (count, domain.clone()))
                    .map(|(domain, _)| domain.clone())
            };
            if let Some(domain) = domain {
                group.increment(&domain);
            }
        }
    }

    /// True when the tracker holds no groups
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn term_namespaces(own: &str, explicit: Option<&[String]>) -> BTreeSet<String> {
    match explicit {
        Some(list) if !list.is_empty() => list.iter().cloned().collect(),
        _ => [own.to_string()].into(),
    }
}

/// Evaluate a label selector against a label map
///
/// `None` and the empty selector both select everything, matching upstream
/// semantics for topology constraints.
pub fn selector_matches(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    for expr in selector.match_expressions.iter().flatten() {
        let value = labels.get(&expr.key);
        let values = expr.values.clone().unwrap_or_default();
        let ok = match expr.operator.as_str() {
            "In" => matches!(value, Some(v) if values.contains(v)),
            "NotIn" => !matches!(value, Some(v) if values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        };
        if !ok {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Affinity, PodAffinity, PodAffinityTerm, PodAntiAffinity, PodSpec,
        TopologySpreadConstraint,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const ZONE: &str = "topology.kubernetes.io/zone";

    fn labeled_pod(name: &str, app: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                labels: Some([("app".to_string(), app.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn app_selector(app: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some([("app".to_string(), app.to_string())].into()),
            ..Default::default()
        }
    }

    fn spread_pod(name: &str, app: &str, max_skew: i32) -> Pod {
        let mut pod = labeled_pod(name, app);
        pod.spec = Some(PodSpec {
            topology_spread_constraints: Some(vec![TopologySpreadConstraint {
                max_skew,
                topology_key: ZONE.into(),
                when_unsatisfiable: "DoNotSchedule".into(),
                label_selector: Some(app_selector(app)),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn zones(topology: &mut Topology) {
        for zone in ["zone-a", "zone-b", "zone-c"] {
            topology.register(ZONE, zone);
        }
    }

    #[test]
    fn spread_admits_only_low_count_domains() {
        let mut topology = Topology::new();
        let pods: Vec<Pod> = (0..4).map(|i| spread_pod(&format!("web-{i}"), "web", 1)).collect();
        for pod in &pods {
            topology.track(pod);
        }
        zones(&mut topology);

        let unconstrained = Requirements::new();
        // all domains empty: every zone admissible
        let narrowed = topology.add_requirements(&pods[0], &unconstrained).unwrap();
        assert_eq!(narrowed.get(ZONE).count(), Some(3));
        topology.record(&pods[0], &narrowed);

        // one pod in zone-a: placing another there would make skew 2 > 1
        let narrowed = topology.add_requirements(&pods[1], &unconstrained).unwrap();
        let zone_req = narrowed.get(ZONE);
        assert!(!zone_req.has("zone-a"));
        assert!(zone_req.has("zone-b"));
        assert!(zone_req.has("zone-c"));
    }

    #[test]
    fn spread_records_emptiest_domain_when_flexible() {
        let mut topology = Topology::new();
        let a = spread_pod("web-0", "web", 1);
        let b = spread_pod("web-1", "web", 1);
        topology.track(&a);
        topology.track(&b);
        zones(&mut topology);

        let narrowed = topology
            .add_requirements(&a, &Requirements::new())
            .unwrap();
        topology.record(&a, &narrowed);
        // flexible placement charged zone-a (smallest name among emptiest)
        let narrowed = topology
            .add_requirements(&b, &Requirements::new())
            .unwrap();
        assert!(!narrowed.get(ZONE).has("zone-a"));
    }

    #[test]
    fn spread_constrained_candidate_can_fail() {
        let mut topology = Topology::new();
        let pods: Vec<Pod> = (0..2).map(|i| spread_pod(&format!("web-{i}"), "web", 1)).collect();
        for pod in &pods {
            topology.track(pod);
        }
        zones(&mut topology);

        let mut zone_a_only = Requirements::new();
        zone_a_only.add(Requirement::new(ZONE, Operator::In, ["zone-a"]));
        let narrowed = topology.add_requirements(&pods[0], &zone_a_only).unwrap();
        topology.record(&pods[0], &narrowed);

        // second pod confined to zone-a while skew forbids it
        let result = topology.add_requirements(&pods[1], &zone_a_only);
        assert!(matches!(
            result,
            Err(SchedulingError::NoTopologyDomains { ref key }) if key == ZONE
        ));
    }

    fn affinity_pod(name: &str, app: &str, target_app: &str) -> Pod {
        let mut pod = labeled_pod(name, app);
        pod.spec = Some(PodSpec {
            affinity: Some(Affinity {
                pod_affinity: Some(PodAffinity {
                    required_during_scheduling_ignored_during_execution: Some(vec![
                        PodAffinityTerm {
                            topology_key: ZONE.into(),
                            label_selector: Some(app_selector(target_app)),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn affinity_follows_running_pods() {
        let mut topology = Topology::new();
        let follower = affinity_pod("cache-0", "cache", "web");
        topology.track(&follower);
        zones(&mut topology);

        // a web pod runs in zone-b
        let running = labeled_pod("web-0", "web");
        topology.count_running(&running, &[(ZONE.to_string(), "zone-b".to_string())].into());

        let narrowed = topology
            .add_requirements(&follower, &Requirements::new())
            .unwrap();
        assert_eq!(narrowed.get(ZONE).single_value(), Some("zone-b"));
    }

    #[test]
    fn self_affinity_seeds_any_domain() {
        let mut topology = Topology::new();
        let pod = affinity_pod("web-0", "web", "web");
        topology.track(&pod);
        zones(&mut topology);

        let narrowed = topology
            .add_requirements(&pod, &Requirements::new())
            .unwrap();
        // no matching pods anywhere yet: requirement is Exists, not empty In
        assert!(narrowed.get(ZONE).count().is_none());
    }

    fn anti_affinity_pod(name: &str, app: &str, avoid_app: &str) -> Pod {
        let mut pod = labeled_pod(name, app);
        pod.spec = Some(PodSpec {
            affinity: Some(Affinity {
                pod_anti_affinity: Some(PodAntiAffinity {
                    required_during_scheduling_ignored_during_execution: Some(vec![
                        PodAffinityTerm {
                            topology_key: ZONE.into(),
                            label_selector: Some(app_selector(avoid_app)),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn anti_affinity_blocks_occupied_domains_both_ways() {
        let mut topology = Topology::new();
        // each db pod repels other db pods
        let first = anti_affinity_pod("db-0", "db", "db");
        let second = anti_affinity_pod("db-1", "db", "db");
        topology.track(&first);
        topology.track(&second);
        zones(&mut topology);

        let narrowed = topology
            .add_requirements(&first, &Requirements::new())
            .unwrap();
        topology.record(&first, &narrowed);

        let narrowed = topology
            .add_requirements(&second, &Requirements::new())
            .unwrap();
        let zone_req = narrowed.get(ZONE);
        // exactly one zone was charged by the first placement
        let blocked = ["zone-a", "zone-b", "zone-c"]
            .iter()
            .filter(|z| !zone_req.has(z))
            .count();
        assert_eq!(blocked, 1);
    }

    #[test]
    fn update_releases_ownership_after_relaxation() {
        let mut topology = Topology::new();
        let mut pod = spread_pod("web-0", "web", 1);
        topology.track(&pod);
        zones(&mut topology);

        // relaxation strips the constraint from the pod spec
        pod.spec.as_mut().unwrap().topology_spread_constraints = None;
        topology.update(&pod);

        let narrowed = topology
            .add_requirements(&pod, &Requirements::new())
            .unwrap();
        assert!(!narrowed.has(ZONE));
    }

    #[test]
    fn selector_matching_supports_expressions() {
        let labels: BTreeMap<String, String> = [("app".to_string(), "web".to_string())].into();
        assert!(selector_matches(None, &labels));
        assert!(selector_matches(Some(&app_selector("web")), &labels));
        assert!(!selector_matches(Some(&app_selector("db")), &labels));

        let expr_selector = LabelSelector {
            match_expressions: Some(vec![
                k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement {
                    key: "app".into(),
                    operator: "NotIn".into(),
                    values: Some(vec!["db".into()]),
                },
            ]),
            ..Default::default()
        };
        assert!(selector_matches(Some(&expr_selector), &labels));
    }
}
