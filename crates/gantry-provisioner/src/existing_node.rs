//! Fitting pods onto nodes that already exist (or are already launching)

use k8s_openapi::api::core::v1::Pod;

use gantry_common::resources::{self, ResourceList};
use gantry_common::HOSTNAME_LABEL;
use gantry_scheduling::{
    pod_key, pod_requirements, taints, Operator, Requirement, Requirements, SchedulingError,
    Topology,
};
use gantry_state::StateNode;

/// One existing (or in-flight) node a scheduling pass may top up
#[derive(Clone, Debug)]
pub struct ExistingNode {
    /// Deep copy of the node's projected state
    pub state: StateNode,
    /// Keys of pods assigned here in this pass
    pub pod_keys: Vec<String>,
    /// Remaining daemon demand plus requests placed this pass
    requests: ResourceList,
    requirements: Requirements,
}

impl ExistingNode {
    /// Wrap a state node for a scheduling pass
    ///
    /// `daemon_resources` is what the daemon set pods targeting this node
    /// will ask for in total; the part they already consumed is subtracted,
    /// clamped at zero per resource so a daemon set that unexpectedly
    /// scheduled cannot create phantom capacity.
    pub fn new(state: StateNode, daemon_resources: &ResourceList, topology: &mut Topology) -> Self {
        let remaining_daemon =
            resources::subtract_clamped(daemon_resources, &state.daemon_requests);
        let mut requirements = Requirements::from_labels(state.labels.iter());
        let hostname = state
            .node_name()
            .unwrap_or(&state.provider_id)
            .to_string();
        requirements.add(Requirement::new(
            HOSTNAME_LABEL,
            Operator::In,
            [hostname.clone()],
        ));
        topology.register(HOSTNAME_LABEL, &hostname);

        Self {
            state,
            pod_keys: Vec::new(),
            requests: remaining_daemon,
            requirements,
        }
    }

    /// Attempt to place a pod on this node
    pub fn add(
        &mut self,
        pod: &Pod,
        extra: &Requirements,
        topology: &mut Topology,
    ) -> Result<(), SchedulingError> {
        taints::tolerates(&self.state.taints, pod)?;
        self.state.host_ports.validate(pod)?;

        let mounted = self.state.volumes.count_with(pod);
        if let Some(limit) = self.state.volume_limit {
            if mounted > limit {
                return Err(SchedulingError::VolumeLimitExceeded {
                    requested: mounted,
                    limit,
                });
            }
        }

        // resource fit first: an in-flight node cannot grow
        let requests = resources::add(&self.requests, &resources::pod_requests(pod));
        if !resources::fits(&requests, &self.state.available()) {
            let blocking = requests
                .keys()
                .find(|k| {
                    resources::millis(&requests[*k])
                        > self
                            .state
                            .available()
                            .get(*k)
                            .map(resources::millis)
                            .unwrap_or(0)
                })
                .cloned()
                .unwrap_or_else(|| "resources".to_string());
            return Err(SchedulingError::ExceedsResources { resource: blocking });
        }

        let mut flexible = pod_requirements(pod, false);
        flexible.extend(extra);
        let surviving = flexible.compatible_terms(&self.requirements)?;

        let mut narrowed = self.requirements.clone();
        narrowed.extend(&surviving.common_requirements());

        let topology_requirements = topology.add_requirements(pod, &narrowed)?;
        narrowed.intersects(&topology_requirements)?;
        narrowed.extend(&topology_requirements);

        // commit
        let key = pod_key(pod);
        self.pod_keys.push(key.clone());
        self.requests = requests;
        self.requirements = narrowed;
        self.state.host_ports.add(&key, pod);
        self.state.volumes.add(&key, pod);
        topology.record(pod, &self.requirements);
        Ok(())
    }

    /// Provider-id of the underlying node
    pub fn provider_id(&self) -> &str {
        &self.state.provider_id
    }
}
