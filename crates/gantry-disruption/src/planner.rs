//! The disruption planner
//!
//! Evaluates removal candidates under the ordered policies drift →
//! expiration → emptiness → consolidation, under a per-pool budget. Every
//! removal that displaces pods is first simulated, then re-validated between
//! proposal and execution.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use gantry_cloud::CloudProvider;
use gantry_common::crd::{ConditionType, ConsolidationPolicy, NodeClaim, NodePool};
use gantry_common::events::{actions, reasons, EventPublisher};
use gantry_common::{metrics, Error, Result};
use gantry_provisioner::template::order_templates;
use gantry_provisioner::ClaimTemplate;
use gantry_scheduling::pod_key;
use gantry_state::Cluster;

use crate::candidate::{Candidate, DisruptionMethod};
use crate::simulation::{simulate, Replacement, SimulationInputs};

/// How often a planning cycle runs
pub const PLAN_INTERVAL: Duration = Duration::from_secs(10);

/// Store access for the planner
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DisruptionClient: Send + Sync {
    /// All claims
    async fn list_claims(&self) -> Result<Vec<NodeClaim>>;

    /// All pools
    async fn pools(&self) -> Result<Vec<NodePool>>;

    /// Pods bound to the named node
    async fn pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    /// True when unschedulable pods are waiting for capacity
    async fn pending_pods_exist(&self) -> Result<bool>;

    /// Synthetic pods representing daemon-set templates
    async fn daemon_set_pods(&self) -> Result<Vec<Pod>>;

    /// Delete a claim, handing it to the termination flow
    async fn delete_claim(&self, name: &str) -> Result<()>;
}

/// Production implementation
pub struct KubeDisruptionClient {
    client: Client,
}

impl KubeDisruptionClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DisruptionClient for KubeDisruptionClient {
    async fn list_claims(&self) -> Result<Vec<NodeClaim>> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn pools(&self) -> Result<Vec<NodePool>> {
        let api: Api<NodePool> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
            .await?;
        Ok(pods.items)
    }

    async fn pending_pods_exist(&self) -> Result<bool> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().fields("spec.nodeName="))
            .await?;
        Ok(pods.items.iter().any(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .map(|conditions| {
                    conditions.iter().any(|c| {
                        c.type_ == "PodScheduled"
                            && c.status == "False"
                            && c.reason.as_deref() == Some("Unschedulable")
                    })
                })
                .unwrap_or(false)
        }))
    }

    async fn daemon_set_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<k8s_openapi::api::apps::v1::DaemonSet> = Api::all(self.client.clone());
        let daemon_sets = api.list(&ListParams::default()).await?;
        Ok(daemon_sets
            .items
            .into_iter()
            .filter_map(|ds| {
                let spec = ds.spec?;
                Some(Pod {
                    metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        name: ds.metadata.name.map(|n| format!("{n}-template")),
                        namespace: ds.metadata.namespace,
                        labels: spec.template.metadata.as_ref().and_then(|m| m.labels.clone()),
                        ..Default::default()
                    },
                    spec: spec.template.spec,
                    ..Default::default()
                })
            })
            .collect())
    }

    async fn delete_claim(&self, name: &str) -> Result<()> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The planner
pub struct Planner {
    client: Arc<dyn DisruptionClient>,
    cloud: Arc<dyn CloudProvider>,
    cluster: Arc<Cluster>,
    events: Arc<dyn EventPublisher>,
}

impl Planner {
    /// Wire up the planner
    pub fn new(
        client: Arc<dyn DisruptionClient>,
        cloud: Arc<dyn CloudProvider>,
        cluster: Arc<Cluster>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            cloud,
            cluster,
            events,
        }
    }

    /// Run planning cycles until cancelled
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(PLAN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.plan_once().await {
                warn!(error = %e, "Disruption planning cycle failed");
            }
        }
    }

    /// One planning cycle; returns the number of disruptions executed
    pub async fn plan_once(&self) -> Result<usize> {
        self.cluster.synchronized().await?;

        let pools = self.client.pools().await?;
        let claims = self.client.list_claims().await?;
        let catalog = self
            .cloud
            .get_instance_types(None)
            .await
            .map_err(|e| Error::cloud_provider("", format!("listing instance types: {e}")))?;
        let daemon_pods = self.client.daemon_set_pods().await?;

        let mut templates: Vec<Arc<ClaimTemplate>> = pools
            .iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .map(|p| Arc::new(ClaimTemplate::from_pool(p)))
            .collect();
        order_templates(&mut templates);
        let inputs = SimulationInputs {
            instance_types: templates
                .iter()
                .map(|t| (t.pool_name.clone(), catalog.clone()))
                .collect(),
            pool_limits: pools
                .iter()
                .filter_map(|p| p.spec.limits.clone().map(|l| (p.name_any(), l)))
                .collect(),
            templates,
            daemon_pods,
        };

        // a pool's budget is its cap minus what is already in flight
        let mut budgets: BTreeMap<String, usize> = BTreeMap::new();
        for pool in &pools {
            let terminating = claims
                .iter()
                .filter(|c| c.pool_name().as_deref() == Some(&pool.name_any()))
                .filter(|c| c.is_terminating())
                .count();
            budgets.insert(
                pool.name_any(),
                (pool.spec.disruption.max_disruptions() as usize).saturating_sub(terminating),
            );
        }

        let mut candidates = Vec::new();
        for claim in &claims {
            let Some(provider_id) = claim.provider_id() else {
                continue;
            };
            let Some(node_name) = claim.status.as_ref().and_then(|s| s.node_name.clone()) else {
                continue;
            };
            let pods = self.client.pods_on_node(&node_name).await?;
            if let Some(candidate) =
                Candidate::build(claim, self.cluster.node(provider_id), pods, &catalog)
            {
                candidates.push(candidate);
            }
        }

        let pool_by_name: BTreeMap<String, &NodePool> =
            pools.iter().map(|p| (p.name_any(), p)).collect();
        let state = self.cluster.snapshot();
        let mut executed = 0usize;

        for method in [
            DisruptionMethod::Drift,
            DisruptionMethod::Expiration,
            DisruptionMethod::Emptiness,
        ] {
            executed += self
                .run_marked_method(method, &candidates, &pool_by_name, &inputs, &state, &mut budgets)
                .await?;
        }
        executed += self
            .consolidate(&candidates, &pool_by_name, &inputs, &state, &mut budgets)
            .await?;
        Ok(executed)
    }

    /// Drift, expiration and emptiness: act on the marked condition
    async fn run_marked_method(
        &self,
        method: DisruptionMethod,
        candidates: &[Candidate],
        pools: &BTreeMap<String, &NodePool>,
        inputs: &SimulationInputs,
        state: &[gantry_state::StateNode],
        budgets: &mut BTreeMap<String, usize>,
    ) -> Result<usize> {
        let started = std::time::Instant::now();
        let condition = match method {
            DisruptionMethod::Drift => ConditionType::Drifted,
            DisruptionMethod::Expiration => ConditionType::Expired,
            DisruptionMethod::Emptiness => ConditionType::Empty,
            DisruptionMethod::Consolidation => unreachable!("handled separately"),
        };

        let mut marked: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.claim.condition_is_true(condition))
            .filter(|c| {
                // an empty node must have stayed empty for the pool's window
                if method != DisruptionMethod::Emptiness {
                    return true;
                }
                let window = pools
                    .get(&c.pool_name())
                    .and_then(|p| p.spec.disruption.consolidate_after().ok().flatten())
                    .unwrap_or(Duration::ZERO);
                let empty_for = (Utc::now() - c.marked_at(condition))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                empty_for >= window
            })
            .collect();
        // oldest mark first
        marked.sort_by_key(|c| c.marked_at(condition));

        let mut executed = 0usize;
        for candidate in marked {
            if budgets.get(&candidate.pool_name()).copied().unwrap_or(0) == 0 {
                debug!(
                    claim = %candidate.claim.name_any(),
                    method = method.as_str(),
                    "Budget exhausted; deferring disruption"
                );
                continue;
            }
            // emptiness needs no replacement; everything else must prove the
            // pods land somewhere
            if method != DisruptionMethod::Emptiness && !candidate.pods.is_empty() {
                let replacement = simulate(inputs, state, &[candidate]);
                if !replacement.all_pods_scheduled || replacement.new_claims.len() > 1 {
                    self.report_blocked(candidate, method).await;
                    continue;
                }
            }
            if self.execute(candidate, method).await? {
                executed += 1;
                if let Some(budget) = budgets.get_mut(&candidate.pool_name()) {
                    *budget = budget.saturating_sub(1);
                }
            }
        }
        metrics::DISRUPTION_EVALUATION_DURATION.record(
            started.elapsed().as_secs_f64(),
            &[KeyValue::new("method", method.as_str())],
        );
        Ok(executed)
    }

    /// Consolidation: replace candidates by a strictly cheaper arrangement
    async fn consolidate(
        &self,
        candidates: &[Candidate],
        pools: &BTreeMap<String, &NodePool>,
        inputs: &SimulationInputs,
        state: &[gantry_state::StateNode],
        budgets: &mut BTreeMap<String, usize>,
    ) -> Result<usize> {
        let started = std::time::Instant::now();
        let eligible = consolidation_eligible(candidates, pools);

        let mut executed = 0usize;
        for candidate in &eligible {
            let candidate = *candidate;
            if budgets.get(&candidate.pool_name()).copied().unwrap_or(0) == 0 {
                continue;
            }
            let replacement = simulate(inputs, state, &[candidate]);
            if !replacement.all_pods_scheduled {
                continue;
            }
            if !strictly_cheaper(&replacement, candidate.price) {
                continue;
            }
            if self
                .execute(candidate, DisruptionMethod::Consolidation)
                .await?
            {
                executed += 1;
                if let Some(budget) = budgets.get_mut(&candidate.pool_name()) {
                    *budget = budget.saturating_sub(1);
                }
                // one consolidation action per cycle: state is stale after a
                // removal
                break;
            }
        }

        // no single node could be consolidated; several together may still
        // combine into one cheaper replacement
        if executed == 0 {
            executed += self
                .consolidate_multi(&eligible, inputs, state, budgets)
                .await?;
        }
        metrics::DISRUPTION_EVALUATION_DURATION.record(
            started.elapsed().as_secs_f64(),
            &[KeyValue::new("method", "consolidation")],
        );
        Ok(executed)
    }

    /// Find the largest least-disruptive prefix that combines into at most
    /// one strictly cheaper replacement claim
    async fn consolidate_multi(
        &self,
        eligible: &[&Candidate],
        inputs: &SimulationInputs,
        state: &[gantry_state::StateNode],
        budgets: &mut BTreeMap<String, usize>,
    ) -> Result<usize> {
        if eligible.len() < 2 {
            return Ok(0);
        }
        let workable = |prefix: &[&Candidate], budgets: &BTreeMap<String, usize>| {
            let mut needed: BTreeMap<String, usize> = BTreeMap::new();
            for candidate in prefix {
                *needed.entry(candidate.pool_name()).or_insert(0) += 1;
            }
            needed
                .iter()
                .all(|(pool, count)| budgets.get(pool).copied().unwrap_or(0) >= *count)
        };

        // binary search the largest prefix whose combined replacement is
        // feasible and strictly cheaper than the nodes it removes
        let mut low = 2usize;
        let mut high = eligible.len();
        let mut best: Option<usize> = None;
        while low <= high {
            let mid = (low + high) / 2;
            let prefix = &eligible[..mid];
            let replacement = simulate(inputs, state, prefix);
            let total_price: f64 = prefix.iter().map(|c| c.price).sum();
            let feasible = replacement.all_pods_scheduled
                && replacement.new_claims.len() <= 1
                && replacement.price() < total_price
                && workable(prefix, budgets);
            if feasible {
                best = Some(mid);
                low = mid + 1;
            } else {
                high = mid - 1;
            }
        }
        let Some(count) = best else {
            return Ok(0);
        };

        let mut executed = 0usize;
        for candidate in &eligible[..count] {
            if self
                .execute(candidate, DisruptionMethod::Consolidation)
                .await?
            {
                executed += 1;
                if let Some(budget) = budgets.get_mut(&candidate.pool_name()) {
                    *budget = budget.saturating_sub(1);
                }
            }
        }
        Ok(executed)
    }

    /// Re-validate, then delete the claim
    async fn execute(&self, candidate: &Candidate, method: DisruptionMethod) -> Result<bool> {
        if !self.validate(candidate).await? {
            metrics::DISRUPTION_VALIDATION_FAILURES
                .add(1, &[KeyValue::new("method", method.as_str())]);
            self.report(candidate, EventType::Warning, reasons::DISRUPTION_ABORTED, format!(
                "validation failed before {} disruption",
                method.as_str()
            ))
            .await;
            return Ok(false);
        }
        info!(
            claim = %candidate.claim.name_any(),
            method = method.as_str(),
            pods = candidate.pods.len(),
            "Disrupting claim"
        );
        self.client
            .delete_claim(&candidate.claim.name_any())
            .await?;
        metrics::DISRUPTION_ACTIONS.add(1, &[KeyValue::new("method", method.as_str())]);
        metrics::CLAIMS_TERMINATED.add(
            1,
            &[
                KeyValue::new("nodepool", candidate.pool_name()),
                KeyValue::new("reason", method.as_str()),
            ],
        );
        self.report(
            candidate,
            EventType::Normal,
            reasons::DISRUPTION_STARTED,
            format!("disrupting via {}", method.as_str()),
        )
        .await;
        Ok(true)
    }

    /// The world must still look like it did at proposal time
    async fn validate(&self, candidate: &Candidate) -> Result<bool> {
        let Some(node_name) = candidate
            .claim
            .status
            .as_ref()
            .and_then(|s| s.node_name.clone())
        else {
            return Ok(false);
        };
        let proposed: std::collections::BTreeSet<String> =
            candidate.pods.iter().map(pod_key).collect();
        let current: std::collections::BTreeSet<String> = self
            .client
            .pods_on_node(&node_name)
            .await?
            .iter()
            .filter(|p| !gantry_state::is_daemon_pod(p))
            .map(pod_key)
            .collect();
        if !current.is_subset(&proposed) {
            debug!(claim = %candidate.claim.name_any(), "New pods landed; aborting disruption");
            return Ok(false);
        }
        // capacity we are about to remove must not be what pending pods need
        if self.client.pending_pods_exist().await? {
            debug!(claim = %candidate.claim.name_any(), "Pending pods exist; aborting disruption");
            return Ok(false);
        }
        Ok(true)
    }

    async fn report_blocked(&self, candidate: &Candidate, method: DisruptionMethod) {
        debug!(
            claim = %candidate.claim.name_any(),
            method = method.as_str(),
            "Replacement simulation failed; keeping node"
        );
        self.report(
            candidate,
            EventType::Warning,
            reasons::DISRUPTION_BLOCKED,
            format!(
                "cannot disrupt via {}: displaced pods would not reschedule",
                method.as_str()
            ),
        )
        .await;
    }

    async fn report(
        &self,
        candidate: &Candidate,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let reference = k8s_openapi::api::core::v1::ObjectReference {
            kind: Some("NodeClaim".into()),
            name: candidate.claim.metadata.name.clone(),
            uid: candidate.claim.metadata.uid.clone(),
            ..Default::default()
        };
        self.events
            .publish(&reference, type_, reason, actions::DISRUPT, Some(note))
            .await;
    }
}

/// Strictly cheaper: replacement claims cost less than the removed node,
/// and pure rescheduling onto existing capacity always qualifies
fn strictly_cheaper(replacement: &Replacement, current_price: f64) -> bool {
    if replacement.new_claims.is_empty() {
        return true;
    }
    replacement.price() < current_price
}

/// Candidates a WhenUnderutilized pool allows consolidation to touch,
/// least disruptive first
fn consolidation_eligible<'a>(
    candidates: &'a [Candidate],
    pools: &BTreeMap<String, &NodePool>,
) -> Vec<&'a Candidate> {
    let mut eligible: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| {
            pools
                .get(&c.pool_name())
                .map(|p| {
                    p.spec.disruption.consolidation_policy
                        == ConsolidationPolicy::WhenUnderutilized
                })
                .unwrap_or(false)
        })
        .filter(|c| {
            // drift/expiration/emptiness already covered these
            !c.claim.condition_is_true(ConditionType::Drifted)
                && !c.claim.condition_is_true(ConditionType::Expired)
                && !c.claim.condition_is_true(ConditionType::Empty)
        })
        .collect();
    // fewest pods first: least disruptive wins ties
    eligible.sort_by_key(|c| (c.pods.len(), c.claim.name_any()));
    eligible
}
