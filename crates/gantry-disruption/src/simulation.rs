//! Replacement simulation
//!
//! Re-runs the scheduler in simulation mode with the candidates' nodes
//! removed from state and their pods pending. The planner only acts when
//! every pod finds a home.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

use gantry_cloud::InstanceType;
use gantry_common::resources::ResourceList;
use gantry_provisioner::{
    ClaimTemplate, InFlightClaim, Scheduler, SchedulerInput, SchedulerOptions,
};
use gantry_state::StateNode;

use crate::candidate::Candidate;

/// Static inputs shared by every simulation in one planning cycle
pub struct SimulationInputs {
    /// Templates in weight order
    pub templates: Vec<Arc<ClaimTemplate>>,
    /// Pool name → permitted instance types
    pub instance_types: BTreeMap<String, Vec<InstanceType>>,
    /// Pool name → provisioning limits
    pub pool_limits: BTreeMap<String, ResourceList>,
    /// Daemon-set pods that follow workloads onto new nodes
    pub daemon_pods: Vec<Pod>,
}

/// What a simulated removal would do
pub struct Replacement {
    /// Claims that would have to be created
    pub new_claims: Vec<InFlightClaim>,
    /// True when every displaced pod reschedules
    pub all_pods_scheduled: bool,
}

impl Replacement {
    /// Combined hourly price of the replacement claims
    pub fn price(&self) -> f64 {
        self.new_claims
            .iter()
            .map(|c| c.price().unwrap_or(f64::MAX))
            .sum()
    }
}

/// Simulate removing the candidates from the cluster
pub fn simulate(
    inputs: &SimulationInputs,
    state: &[StateNode],
    candidates: &[&Candidate],
) -> Replacement {
    let removed: BTreeSet<&str> = candidates
        .iter()
        .map(|c| c.state.provider_id.as_str())
        .collect();
    let remaining: Vec<StateNode> = state
        .iter()
        .filter(|n| !removed.contains(n.provider_id.as_str()))
        .cloned()
        .collect();
    let displaced: Vec<Pod> = candidates
        .iter()
        .flat_map(|c| c.pods.iter().cloned())
        .collect();

    let scheduler = Scheduler::new(
        SchedulerInput {
            templates: inputs.templates.clone(),
            instance_types: inputs.instance_types.clone(),
            pool_limits: inputs.pool_limits.clone(),
            state_nodes: remaining,
            daemon_pods: inputs.daemon_pods.clone(),
            running_pods: Vec::new(),
            volume_requirements: BTreeMap::new(),
        },
        SchedulerOptions { simulation: true },
    );
    let results = scheduler.solve(displaced);
    Replacement {
        all_pods_scheduled: results.all_pods_scheduled(),
        new_claims: results.new_claims,
    }
}
