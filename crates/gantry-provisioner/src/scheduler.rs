//! The batched bin-packing scheduler
//!
//! Given pending pods, templates and a state snapshot, produce assignments
//! to existing capacity plus a minimal set of new claims with concrete
//! instance-type options. Deterministic for identical inputs; per-pod
//! failures are reported, never raised.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info};

use gantry_cloud::instance_type::InstanceType;
use gantry_common::resources::{self, ResourceList};
use gantry_common::{HOSTNAME_LABEL, INSTANCE_TYPE_LABEL};
use gantry_scheduling::{
    pod_key, pod_requirements, taints, Operator, Requirement, Requirements, Topology,
};
use gantry_state::StateNode;

use crate::claim::InFlightClaim;
use crate::existing_node::ExistingNode;
use crate::preferences;
use crate::queue::Queue;
use crate::template::ClaimTemplate;

/// Scheduling pass options
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerOptions {
    /// Disruption simulations skip event recording and nominations
    pub simulation: bool,
}

/// Outcome of one scheduling pass
#[derive(Debug, Default)]
pub struct Results {
    /// Claims to create, with their packed pods
    pub new_claims: Vec<InFlightClaim>,
    /// Existing nodes that absorbed pods this pass
    pub existing_nodes: Vec<ExistingNode>,
    /// Reasons per unschedulable pod, keyed by `namespace/name`
    pub pod_errors: BTreeMap<String, String>,
}

impl Results {
    /// True when every pod found a home
    pub fn all_pods_scheduled(&self) -> bool {
        self.pod_errors.is_empty()
    }

    /// Presentation form of the per-pod errors, truncated at five
    pub fn pod_scheduling_errors(&self) -> String {
        if self.pod_errors.is_empty() {
            return "No pod scheduling errors".to_string();
        }
        const MAX_ERRORS: usize = 5;
        let mut message = String::from("not all pods would schedule, ");
        for (i, (pod, reason)) in self.pod_errors.iter().enumerate() {
            if i >= MAX_ERRORS {
                message.push_str(&format!(
                    " and {} other(s)",
                    self.pod_errors.len() - MAX_ERRORS
                ));
                break;
            }
            message.push_str(&format!("{pod} => {reason} "));
        }
        message
    }
}

/// One scheduling pass over a batch of pods
pub struct Scheduler {
    templates: Vec<Arc<ClaimTemplate>>,
    instance_types: BTreeMap<String, Vec<InstanceType>>,
    daemon_overhead: BTreeMap<String, ResourceList>,
    remaining_limits: BTreeMap<String, ResourceList>,
    existing_nodes: Vec<ExistingNode>,
    new_claims: Vec<InFlightClaim>,
    topology: Topology,
    volume_requirements: BTreeMap<String, Requirements>,
    opts: SchedulerOptions,
    /// State handed over at construction, consumed by `solve`
    pending_state: Option<PendingState>,
}

type PendingState = (
    Vec<StateNode>,
    Vec<Pod>,
    Vec<(Pod, BTreeMap<String, String>)>,
);

/// Everything a scheduling pass needs, gathered by the caller
pub struct SchedulerInput {
    /// Templates in weight order (highest first)
    pub templates: Vec<Arc<ClaimTemplate>>,
    /// Pool name → permitted instance types (offerings already filtered for
    /// availability, kubelet overrides already applied)
    pub instance_types: BTreeMap<String, Vec<InstanceType>>,
    /// Pool name → configured provisioning limits
    pub pool_limits: BTreeMap<String, ResourceList>,
    /// State snapshot (owned and unowned nodes; the scheduler filters)
    pub state_nodes: Vec<StateNode>,
    /// Daemon-set pods that may schedule onto new nodes
    pub daemon_pods: Vec<Pod>,
    /// Running pods with their node labels, for topology counting
    pub running_pods: Vec<(Pod, BTreeMap<String, String>)>,
    /// Per-pod volume topology requirements, keyed by `namespace/name`
    pub volume_requirements: BTreeMap<String, Requirements>,
}

impl Scheduler {
    /// Assemble a pass from gathered inputs
    pub fn new(input: SchedulerInput, opts: SchedulerOptions) -> Self {
        let mut remaining_limits = input.pool_limits.clone();

        // limits are recomputed from live state each cycle, not trusted from
        // a status field
        for node in &input.state_nodes {
            if let Some(pool) = node.pool_name() {
                if let Some(remaining) = remaining_limits.get_mut(pool) {
                    *remaining = resources::subtract(remaining, &node.capacity);
                }
            }
        }

        let daemon_overhead = input
            .templates
            .iter()
            .map(|template| {
                let overhead = daemon_overhead_for(template, &input.daemon_pods);
                (template.pool_name.clone(), overhead)
            })
            .collect();

        Self {
            templates: input.templates,
            instance_types: input.instance_types,
            daemon_overhead,
            remaining_limits,
            existing_nodes: Vec::new(),
            new_claims: Vec::new(),
            topology: Topology::new(),
            volume_requirements: input.volume_requirements,
            opts,
            pending_state: None,
        }
        .with_state(input.state_nodes, input.daemon_pods, input.running_pods)
    }

    fn with_state(
        mut self,
        state_nodes: Vec<StateNode>,
        daemon_pods: Vec<Pod>,
        running_pods: Vec<(Pod, BTreeMap<String, String>)>,
    ) -> Self {
        // only nodes owned by gantry are packing targets, initialized nodes
        // first so consolidation prefers stable capacity, then by name
        let mut owned: Vec<StateNode> = state_nodes
            .into_iter()
            .filter(|n| n.owned() && !n.marked_for_deletion)
            .collect();
        owned.sort_by(|a, b| {
            b.initialized
                .cmp(&a.initialized)
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        });
        self.pending_state = Some((owned, daemon_pods, running_pods));
        self
    }

    /// Run the pass
    pub fn solve(mut self, pods: Vec<Pod>) -> Results {
        // topology groups exist before domains are registered or counts seeded
        for pod in &pods {
            self.topology.track(pod);
        }
        let (owned, daemon_pods, running_pods) =
            self.pending_state.take().expect("state attached at construction");
        self.register_domains(&owned);
        for (pod, node_labels) in &running_pods {
            self.topology.count_running(pod, node_labels);
        }
        for node in owned {
            let daemon_resources = self
                .daemon_overhead_for_node(&node, &daemon_pods);
            self.existing_nodes.push(ExistingNode::new(
                node,
                &daemon_resources,
                &mut self.topology,
            ));
        }

        let mut errors: BTreeMap<String, String> = BTreeMap::new();
        let mut queue = Queue::new(pods);
        while let Some(mut pod) = queue.pop() {
            let key = pod_key(&pod);
            match self.add(&pod) {
                Ok(()) => {
                    errors.remove(&key);
                }
                Err(reason) => {
                    errors.insert(key, reason);
                    let relaxed = preferences::relax(&mut pod);
                    if relaxed {
                        self.topology.update(&pod);
                    }
                    queue.push(pod, relaxed);
                }
            }
        }

        for claim in &mut self.new_claims {
            claim.finalize();
        }

        // keep errors only for pods that terminally failed
        let failed: std::collections::BTreeSet<String> =
            queue.failed().iter().map(pod_key).collect();
        errors.retain(|key, _| failed.contains(key));

        if !self.opts.simulation && !self.new_claims.is_empty() {
            let pod_count: usize = self.new_claims.iter().map(|c| c.pod_count()).sum();
            info!(
                claims = self.new_claims.len(),
                pods = pod_count,
                "Computed new claims to fit pods"
            );
        }

        Results {
            new_claims: self.new_claims,
            existing_nodes: self
                .existing_nodes
                .into_iter()
                .filter(|n| !n.pod_keys.is_empty())
                .collect(),
            pod_errors: errors,
        }
    }

    /// Try existing capacity, then proposed claims, then a new claim
    fn add(&mut self, pod: &Pod) -> Result<(), String> {
        let key = pod_key(pod);
        let extra = self
            .volume_requirements
            .get(&key)
            .cloned()
            .unwrap_or_default();

        for node in &mut self.existing_nodes {
            if node.add(pod, &extra, &mut self.topology).is_ok() {
                return Ok(());
            }
        }

        // smallest proposed claim first keeps packing tight
        self.new_claims.sort_by_key(|c| c.pod_count());
        for claim in &mut self.new_claims {
            if claim.add(pod, &extra, &mut self.topology).is_ok() {
                return Ok(());
            }
        }

        let mut reasons: Vec<String> = Vec::new();
        for template in self.templates.clone() {
            let pool = &template.pool_name;
            let types = self.instance_types.get(pool).cloned().unwrap_or_default();
            let types = permitted_types_for_pod(types, pod);
            let types = match self.remaining_limits.get(pool) {
                Some(remaining) => {
                    let filtered: Vec<InstanceType> = types
                        .into_iter()
                        .filter(|it| !resources::exceeds_any(&it.capacity, remaining))
                        .collect();
                    if filtered.is_empty() {
                        reasons.push(format!(
                            "all available instance types exceed limits for pool {pool:?}"
                        ));
                        continue;
                    }
                    filtered
                }
                None => types,
            };
            if types.is_empty() {
                reasons.push(format!("no instance types available for pool {pool:?}"));
                continue;
            }

            let overhead = self
                .daemon_overhead
                .get(pool)
                .cloned()
                .unwrap_or_default();
            let mut claim = InFlightClaim::new(template.clone(), types, overhead.clone());

            // each proposed claim is its own hostname domain
            let hostname = format!("{pool}-claim-{}", self.new_claims.len() + 1);
            claim.requirements.add(Requirement::new(
                HOSTNAME_LABEL,
                Operator::In,
                [hostname.clone()],
            ));
            self.topology.register(HOSTNAME_LABEL, &hostname);

            match claim.add(pod, &extra, &mut self.topology) {
                Ok(()) => {
                    if let Some(remaining) = self.remaining_limits.get_mut(pool) {
                        // pessimistic: assume the cloud picks the largest of
                        // the remaining options
                        let max_shape = resources::element_max(
                            claim.instance_types.iter().map(|it| &it.capacity),
                        );
                        *remaining = resources::subtract(remaining, &max_shape);
                    }
                    self.new_claims.push(claim);
                    return Ok(());
                }
                Err(err) => {
                    reasons.push(format!(
                        "incompatible with pool {pool:?}, daemonset overhead={}, {err}",
                        resources::display(&overhead)
                    ));
                }
            }
        }
        debug!(pod = %key, "No template fits pod");
        Err(reasons.join("; "))
    }

    fn register_domains(&mut self, state_nodes: &[StateNode]) {
        let mut domains: Vec<(String, String)> = Vec::new();
        for template in &self.templates {
            for requirement in template.requirements.values() {
                // only allowlists describe domains a template can produce
                if requirement.count().is_none() {
                    continue;
                }
                for value in requirement.values() {
                    domains.push((requirement.key().to_string(), value.to_string()));
                }
            }
            // templates admit every zone and capacity type their pool's
            // instance types offer
            if let Some(types) = self.instance_types.get(&template.pool_name) {
                for it in types {
                    for offering in &it.offerings {
                        domains.push((
                            gantry_common::ZONE_LABEL.to_string(),
                            offering.zone.clone(),
                        ));
                        domains.push((
                            gantry_common::CAPACITY_TYPE_LABEL.to_string(),
                            offering.capacity_type.clone(),
                        ));
                    }
                }
            }
        }
        for node in state_nodes {
            for (key, value) in &node.labels {
                domains.push((key.clone(), value.clone()));
            }
        }
        for (key, value) in domains {
            self.topology.register(&key, &value);
        }
    }

    fn daemon_overhead_for_node(&self, node: &StateNode, daemon_pods: &[Pod]) -> ResourceList {
        let node_requirements = Requirements::from_labels(node.labels.iter());
        let eligible: Vec<&Pod> = daemon_pods
            .iter()
            .filter(|pod| taints::tolerates(&node.taints, pod).is_ok())
            .filter(|pod| {
                pod_requirements(pod, true)
                    .compatible_terms(&node_requirements)
                    .is_ok()
            })
            .collect();
        resources::requests_for_pods(eligible.into_iter())
    }
}

/// Daemon-set pods that will land on any node of this template
fn daemon_overhead_for(template: &ClaimTemplate, daemon_pods: &[Pod]) -> ResourceList {
    let eligible: Vec<&Pod> = daemon_pods
        .iter()
        .filter(|pod| taints::tolerates(&template.all_taints(), pod).is_ok())
        .filter(|pod| {
            pod_requirements(pod, true)
                .compatible_terms(&template.requirements)
                .is_ok()
        })
        .collect();
    resources::requests_for_pods(eligible.into_iter())
}

/// Deprioritized shapes stay out unless the pod explicitly selects them
fn permitted_types_for_pod(types: Vec<InstanceType>, pod: &Pod) -> Vec<InstanceType> {
    let requests = resources::pod_requests(pod);
    let flexible = pod_requirements(pod, false);
    types
        .into_iter()
        .filter(|it| {
            if !it.is_deprioritized() {
                return true;
            }
            // the pod asks for an extended resource this shape provides
            let provides_requested_extended = it.capacity.iter().any(|(resource, quantity)| {
                !matches!(
                    resource.as_str(),
                    "cpu" | "memory" | "ephemeral-storage" | "pods"
                ) && resources::millis(quantity) > 0
                    && requests.get(resource).map(resources::millis).unwrap_or(0) > 0
            });
            // or names the shape outright
            let named = flexible.terms().iter().any(|term| {
                term.has(INSTANCE_TYPE_LABEL) && term.get(INSTANCE_TYPE_LABEL).has(&it.name)
            });
            provides_requested_extended || named
        })
        .collect()
}
