//! Disruption candidates
//!
//! A candidate is one initialized, undisturbed claim together with its
//! projected node, its workload pods, and the hourly price of keeping it.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

use gantry_cloud::InstanceType;
use gantry_common::crd::{ConditionType, NodeClaim};
use gantry_common::{CAPACITY_TYPE_LABEL, DO_NOT_DISRUPT_ANNOTATION, INSTANCE_TYPE_LABEL, ZONE_LABEL};
use gantry_state::{is_daemon_pod, StateNode};

/// Why a candidate was selected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisruptionMethod {
    /// The claim's instance no longer matches its desired configuration
    Drift,
    /// The claim outlived its pool's expiry
    Expiration,
    /// The claim carries no workload pods
    Emptiness,
    /// A strictly cheaper shape can host the claim's pods
    Consolidation,
}

impl DisruptionMethod {
    /// Metric label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drift => "drift",
            Self::Expiration => "expiration",
            Self::Emptiness => "emptiness",
            Self::Consolidation => "consolidation",
        }
    }
}

/// One disruptable claim and everything needed to judge its removal
#[derive(Clone, Debug)]
pub struct Candidate {
    /// The claim under consideration
    pub claim: NodeClaim,
    /// Its projected node
    pub state: StateNode,
    /// Workload (non-daemon) pods currently on the node
    pub pods: Vec<Pod>,
    /// Hourly price of the node's current offering; `MAX` when unknown
    pub price: f64,
}

impl Candidate {
    /// Build a candidate when the claim is eligible for disruption at all
    ///
    /// Requires an initialized, non-terminating claim whose node is known,
    /// with no do-not-disrupt annotation on the claim or any of its pods.
    pub fn build(
        claim: &NodeClaim,
        state: Option<StateNode>,
        pods: Vec<Pod>,
        catalog: &[InstanceType],
    ) -> Option<Self> {
        if claim.is_terminating() || !claim.condition_is_true(ConditionType::Initialized) {
            return None;
        }
        let state = state?;
        if claim
            .metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key(DO_NOT_DISRUPT_ANNOTATION))
            .unwrap_or(false)
        {
            return None;
        }
        let workload: Vec<Pod> = pods.into_iter().filter(|p| !is_daemon_pod(p)).collect();
        if workload.iter().any(|p| {
            p.metadata
                .annotations
                .as_ref()
                .map(|a| a.contains_key(DO_NOT_DISRUPT_ANNOTATION))
                .unwrap_or(false)
        }) {
            return None;
        }
        let price = current_price(&state, catalog);
        Some(Self {
            claim: claim.clone(),
            state,
            pods: workload,
            price,
        })
    }

    /// When the given condition turned true, for oldest-first ordering
    pub fn marked_at(&self, condition: ConditionType) -> DateTime<Utc> {
        self.claim
            .condition_transitioned_at(condition)
            .unwrap_or_else(Utc::now)
    }

    /// Owning pool name
    pub fn pool_name(&self) -> String {
        self.claim.pool_name().unwrap_or_default()
    }
}

/// Price of the offering the node is currently running on
fn current_price(state: &StateNode, catalog: &[InstanceType]) -> f64 {
    let instance_type = state.labels.get(INSTANCE_TYPE_LABEL);
    let zone = state.labels.get(ZONE_LABEL);
    let capacity_type = state.labels.get(CAPACITY_TYPE_LABEL);
    let (Some(instance_type), Some(zone), Some(capacity_type)) =
        (instance_type, zone, capacity_type)
    else {
        return f64::MAX;
    };
    catalog
        .iter()
        .find(|it| &it.name == instance_type)
        .and_then(|it| {
            it.offerings
                .iter()
                .find(|o| &o.zone == zone && &o.capacity_type == capacity_type)
        })
        .map(|o| o.price)
        .unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_cloud::fake::default_catalog;
    use gantry_common::crd::{NodeClaimSpec, NodeClaimStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use kube::ResourceExt;

    fn initialized_claim() -> NodeClaim {
        let mut c = NodeClaim::new("default-x7k2p", NodeClaimSpec::default());
        let mut status = NodeClaimStatus {
            provider_id: Some("fake:///zone-a/n1".into()),
            node_name: Some("node-1".into()),
            ..Default::default()
        };
        status.mark_true(ConditionType::Launched);
        status.mark_true(ConditionType::Registered);
        status.mark_true(ConditionType::Initialized);
        c.status = Some(status);
        c
    }

    fn state() -> StateNode {
        let mut s = StateNode::from_claim("fake:///zone-a/n1");
        s.labels
            .insert(INSTANCE_TYPE_LABEL.to_string(), "m5.xlarge".into());
        s.labels.insert(ZONE_LABEL.to_string(), "zone-a".into());
        s.labels
            .insert(CAPACITY_TYPE_LABEL.to_string(), "on-demand".into());
        s
    }

    fn daemon() -> Pod {
        Pod {
            metadata: ObjectMeta {
                owner_references: Some(vec![OwnerReference {
                    kind: "DaemonSet".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn candidate_resolves_its_offering_price() {
        let candidate =
            Candidate::build(&initialized_claim(), Some(state()), vec![daemon()], &default_catalog())
                .unwrap();
        assert_eq!(candidate.price, 0.20);
        // daemons are not workload pods
        assert!(candidate.pods.is_empty());
    }

    #[test]
    fn do_not_disrupt_blocks_candidacy() {
        let mut claim = initialized_claim();
        claim
            .annotations_mut()
            .insert(DO_NOT_DISRUPT_ANNOTATION.to_string(), "true".into());
        assert!(Candidate::build(&claim, Some(state()), vec![], &default_catalog()).is_none());

        let mut guarded_pod = Pod::default();
        guarded_pod.metadata.annotations =
            Some([(DO_NOT_DISRUPT_ANNOTATION.to_string(), "true".to_string())].into());
        assert!(Candidate::build(
            &initialized_claim(),
            Some(state()),
            vec![guarded_pod],
            &default_catalog()
        )
        .is_none());
    }

    #[test]
    fn uninitialized_claims_are_not_candidates() {
        let claim = NodeClaim::new("default-x7k2p", NodeClaimSpec::default());
        assert!(Candidate::build(&claim, Some(state()), vec![], &default_catalog()).is_none());
    }

    #[test]
    fn unknown_offering_prices_at_max() {
        let mut s = state();
        s.labels.remove(CAPACITY_TYPE_LABEL);
        let candidate =
            Candidate::build(&initialized_claim(), Some(s), vec![], &default_catalog()).unwrap();
        assert_eq!(candidate.price, f64::MAX);
    }
}
