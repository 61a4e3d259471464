//! Requirement sets and their compatibility rules
//!
//! A [`Requirements`] is an AND of per-key requirements. A
//! [`FlexibleRequirements`] is an OR of those (required node affinity with
//! multiple terms). Compatibility over a flexible set keeps only the terms
//! that intersect.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{NodeSelectorRequirement, NodeSelectorTerm, Pod};

use gantry_common::crd::RequirementSpec;
use gantry_common::{is_restricted_label, well_known_labels};

use crate::error::SchedulingError;
use crate::requirement::{Operator, Requirement};

/// An AND-set of requirements, keyed by label
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Requirements {
    inner: BTreeMap<String, Requirement>,
}

impl Requirements {
    /// An empty (everything-allowed) set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from concrete node labels: each label becomes `In{value}`
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut r = Self::new();
        for (key, value) in labels {
            r.add(Requirement::new(key.clone(), Operator::In, [value.clone()]));
        }
        r
    }

    /// Build from CRD requirement specs
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a RequirementSpec>) -> Self {
        let mut r = Self::new();
        for spec in specs {
            r.add(Requirement::from_spec(spec));
        }
        r
    }

    /// Build from upstream node-selector requirements
    pub fn from_node_selector<'a>(
        requirements: impl IntoIterator<Item = &'a NodeSelectorRequirement>,
    ) -> Self {
        let mut r = Self::new();
        for req in requirements {
            let operator = match req.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                "Gt" => Operator::Gt,
                "Lt" => Operator::Lt,
                _ => continue,
            };
            r.add(Requirement::new(
                req.key.clone(),
                operator,
                req.values.clone().unwrap_or_default(),
            ));
        }
        r
    }

    /// Add requirements, intersecting with any existing requirement per key
    pub fn add(&mut self, requirement: Requirement) {
        let key = requirement.key().to_string();
        let merged = match self.inner.get(&key) {
            Some(existing) => existing.intersection(&requirement),
            None => requirement,
        };
        self.inner.insert(key, merged);
    }

    /// Add every requirement of another set
    pub fn extend(&mut self, other: &Requirements) {
        for requirement in other.inner.values() {
            self.add(requirement.clone());
        }
    }

    /// True when a requirement exists for the key
    pub fn has(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// The requirement for a key; an undefined key allows any value
    pub fn get(&self, key: &str) -> Requirement {
        self.inner
            .get(key)
            .cloned()
            .unwrap_or_else(|| Requirement::new(key, Operator::Exists, Vec::<String>::new()))
    }

    /// The keys constrained by this set
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(|k| k.as_str())
    }

    /// Iterate the requirements
    pub fn values(&self) -> impl Iterator<Item = &Requirement> {
        self.inner.values()
    }

    /// Check the provided requirements can be met by this set
    ///
    /// Labels outside the well-known set must be defined here to count as
    /// known, except when the incoming operator is NotIn/DoesNotExist (those
    /// trivially intersect an undefined key). Well-known labels resolve
    /// against offerings, so an undefined key is allowed.
    pub fn compatible(&self, incoming: &Requirements) -> Result<(), SchedulingError> {
        let well_known = well_known_labels();
        for key in incoming.keys() {
            if well_known.contains(key) || self.has(key) {
                continue;
            }
            let operator = incoming.get(key).operator();
            if matches!(operator, Operator::NotIn | Operator::DoesNotExist) {
                continue;
            }
            return Err(SchedulingError::UnknownLabel {
                key: key.to_string(),
                hint: label_hint(self, key),
            });
        }
        self.intersects(incoming)
    }

    /// Check overlapping keys all have a common value; undefined keys allowed
    pub fn intersects(&self, incoming: &Requirements) -> Result<(), SchedulingError> {
        for (key, existing) in &self.inner {
            let Some(other) = incoming.inner.get(key) else {
                continue;
            };
            if existing.intersects(other) {
                continue;
            }
            // NotIn/DoesNotExist pairs trivially intersect on the absent value
            let incoming_op = other.operator();
            let existing_op = existing.operator();
            let loose = |op: Operator| matches!(op, Operator::NotIn | Operator::DoesNotExist);
            if loose(incoming_op) && loose(existing_op) {
                continue;
            }
            return Err(SchedulingError::EmptyIntersection {
                key: key.clone(),
                incoming: other.to_string(),
                existing: existing.to_string(),
            });
        }
        Ok(())
    }

    /// Single-value resolved labels, exposed as concrete node labels at launch
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.inner
            .iter()
            .filter(|(key, _)| !is_restricted_label(key))
            .filter_map(|(key, req)| req.single_value().map(|v| (key.clone(), v.to_string())))
            .collect()
    }

    /// Render to CRD requirement specs
    pub fn to_specs(&self) -> Vec<RequirementSpec> {
        self.inner.values().map(|r| r.to_spec()).collect()
    }
}

impl std::fmt::Display for Requirements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .inner
            .values()
            .filter(|r| !is_restricted_label(r.key()))
            .map(|r| r.to_string())
            .collect();
        write!(f, "{}", rendered.join(", "))
    }
}

/// An OR of requirement sets (required node affinity terms)
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlexibleRequirements {
    terms: Vec<Requirements>,
}

impl FlexibleRequirements {
    /// A flexible set with a single unconstrained term
    pub fn unconstrained() -> Self {
        Self {
            terms: vec![Requirements::new()],
        }
    }

    /// Build from explicit terms; no terms means unconstrained
    pub fn from_terms(terms: Vec<Requirements>) -> Self {
        if terms.is_empty() {
            Self::unconstrained()
        } else {
            Self { terms }
        }
    }

    /// Add a requirement to every term (an AND across the OR)
    pub fn add(&mut self, requirement: Requirement) {
        for term in &mut self.terms {
            term.add(requirement.clone());
        }
    }

    /// Add a whole requirement set to every term
    pub fn extend(&mut self, other: &Requirements) {
        for term in &mut self.terms {
            term.extend(other);
        }
    }

    /// The terms of the OR
    pub fn terms(&self) -> &[Requirements] {
        &self.terms
    }

    /// Keep only the terms compatible with `existing`
    ///
    /// Fails when no term survives; the surviving subset is what the caller
    /// narrows the candidate's requirements with.
    pub fn compatible_terms(
        &self,
        existing: &Requirements,
    ) -> Result<FlexibleRequirements, SchedulingError> {
        let surviving: Vec<Requirements> = self
            .terms
            .iter()
            .filter(|term| existing.compatible(term).is_ok())
            .cloned()
            .collect();
        if surviving.is_empty() {
            return Err(SchedulingError::NoCompatibleTerms);
        }
        Ok(FlexibleRequirements { terms: surviving })
    }

    /// Requirements common to every surviving term
    ///
    /// Only keys constrained identically across all terms narrow the
    /// candidate; diverging keys stay flexible until more pods land.
    pub fn common_requirements(&self) -> Requirements {
        let Some((first, rest)) = self.terms.split_first() else {
            return Requirements::new();
        };
        let mut common = Requirements::new();
        for requirement in first.values() {
            if rest
                .iter()
                .all(|t| t.has(requirement.key()) && &t.get(requirement.key()) == requirement)
            {
                common.add(requirement.clone());
            }
        }
        common
    }
}

/// Pod-derived scheduling requirements
///
/// Merges the node selector, required node affinity (OR-of-AND), and, unless
/// preferences were relaxed away, the heaviest preferred node affinity term.
pub fn pod_requirements(pod: &Pod, ignore_preferred: bool) -> FlexibleRequirements {
    let selector_requirements = Requirements::from_labels(
        pod.spec
            .as_ref()
            .and_then(|s| s.node_selector.as_ref())
            .into_iter()
            .flatten(),
    );

    let node_affinity = pod
        .spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref());

    let mut flexible = match node_affinity.and_then(|na| {
        na.required_during_scheduling_ignored_during_execution
            .as_ref()
    }) {
        Some(required) => FlexibleRequirements::from_terms(
            required
                .node_selector_terms
                .iter()
                .map(term_requirements)
                .collect(),
        ),
        None => FlexibleRequirements::unconstrained(),
    };
    flexible.extend(&selector_requirements);

    if !ignore_preferred {
        if let Some(preferred) =
            node_affinity.and_then(|na| na.preferred_during_scheduling_ignored_during_execution.as_ref())
        {
            // the heaviest preference is treated as required; the relaxation
            // loop drops it if nothing can satisfy it
            if let Some(heaviest) = preferred.iter().max_by_key(|p| p.weight) {
                flexible.extend(&term_requirements(&heaviest.preference));
            }
        }
    }
    flexible
}

fn term_requirements(term: &NodeSelectorTerm) -> Requirements {
    Requirements::from_node_selector(term.match_expressions.iter().flatten())
}

/// Suffix suggesting a likely intended key for an unknown label
fn label_hint(existing: &Requirements, key: &str) -> String {
    for known in well_known_labels() {
        if known.contains(key) || edit_distance(key, known) < known.len() / 5 {
            return format!(" (did you mean {known:?}?)");
        }
    }
    for candidate in existing.keys() {
        if candidate.contains(key) || edit_distance(key, candidate) < candidate.len() / 5 {
            return format!(" (did you mean {candidate:?}?)");
        }
    }
    String::new()
}

fn edit_distance(s: &str, t: &str) -> usize {
    let s: Vec<char> = s.chars().collect();
    let t: Vec<char> = t.chars().collect();
    if s.is_empty() {
        return t.len();
    }
    if t.is_empty() {
        return s.len();
    }
    let mut prev: Vec<usize> = (0..=t.len()).collect();
    let mut cur = vec![0usize; t.len() + 1];
    for i in 1..=s.len() {
        cur[0] = i;
        for j in 1..=t.len() {
            let diff = usize::from(s[i - 1] != t[j - 1]);
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + diff);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[t.len()]
}
