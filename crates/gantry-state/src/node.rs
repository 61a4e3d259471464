//! The per-node state projection
//!
//! A [`StateNode`] is created as soon as a claim launches (claim-backed,
//! carrying the claim's reported capacity) and enriched when the real node
//! registers. The scheduler packs against these, so the struct tracks
//! everything a fit check needs: remaining resources, daemon overhead,
//! host-port usage and volume usage.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use k8s_openapi::api::core::v1::{Pod, Taint};

use gantry_common::resources::{self, ResourceList};

/// Host port reservations on one node
#[derive(Clone, Debug, Default)]
pub struct HostPortUsage {
    entries: Vec<PortEntry>,
}

#[derive(Clone, Debug, PartialEq)]
struct PortEntry {
    pod: String,
    host_ip: String,
    port: i32,
    protocol: String,
}

impl HostPortUsage {
    fn ports_of(pod: &Pod) -> Vec<(String, i32, String)> {
        let mut out = Vec::new();
        let containers = pod
            .spec
            .as_ref()
            .map(|s| s.containers.iter())
            .into_iter()
            .flatten();
        for container in containers {
            for port in container.ports.iter().flatten() {
                if let Some(host_port) = port.host_port {
                    out.push((
                        port.host_ip.clone().unwrap_or_else(|| "0.0.0.0".into()),
                        host_port,
                        port.protocol.clone().unwrap_or_else(|| "TCP".into()),
                    ));
                }
            }
        }
        out
    }

    /// Check the pod's host ports are free
    pub fn validate(&self, pod: &Pod) -> Result<(), gantry_scheduling::SchedulingError> {
        for (host_ip, port, protocol) in Self::ports_of(pod) {
            let conflict = self.entries.iter().any(|e| {
                e.port == port
                    && e.protocol == protocol
                    && (e.host_ip == host_ip || e.host_ip == "0.0.0.0" || host_ip == "0.0.0.0")
            });
            if conflict {
                return Err(gantry_scheduling::SchedulingError::HostPortConflict {
                    host_ip,
                    port,
                    protocol,
                });
            }
        }
        Ok(())
    }

    /// Reserve the pod's host ports
    pub fn add(&mut self, pod_key: &str, pod: &Pod) {
        for (host_ip, port, protocol) in Self::ports_of(pod) {
            self.entries.push(PortEntry {
                pod: pod_key.to_string(),
                host_ip,
                port,
                protocol,
            });
        }
    }

    /// Release every port held by the pod
    pub fn remove(&mut self, pod_key: &str) {
        self.entries.retain(|e| e.pod != pod_key);
    }
}

/// Persistent volume claims mounted on one node
#[derive(Clone, Debug, Default)]
pub struct VolumeUsage {
    mounted: BTreeSet<String>,
    by_pod: BTreeMap<String, Vec<String>>,
}

impl VolumeUsage {
    fn claims_of(pod: &Pod) -> Vec<String> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        pod.spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|v| v.persistent_volume_claim.as_ref())
            .map(|c| format!("{namespace}/{}", c.claim_name))
            .collect()
    }

    /// Volumes that would be mounted if the pod schedules here
    pub fn count_with(&self, pod: &Pod) -> usize {
        let mut projected = self.mounted.clone();
        projected.extend(Self::claims_of(pod));
        projected.len()
    }

    /// Current mounted volume count
    pub fn count(&self) -> usize {
        self.mounted.len()
    }

    /// Track the pod's claims as mounted
    pub fn add(&mut self, pod_key: &str, pod: &Pod) {
        let claims = Self::claims_of(pod);
        self.mounted.extend(claims.iter().cloned());
        self.by_pod.insert(pod_key.to_string(), claims);
    }

    /// Release the pod's claims (shared claims stay if another pod uses them)
    pub fn remove(&mut self, pod_key: &str) {
        self.by_pod.remove(pod_key);
        self.mounted = self.by_pod.values().flatten().cloned().collect();
    }
}

/// One node (or in-flight claim) in the projection
#[derive(Clone, Debug)]
pub struct StateNode {
    /// Primary key across the desired, state and cloud views
    pub provider_id: String,
    /// Names of registered nodes carrying this provider-id; more than one is
    /// an invariant violation surfaced as MultipleNodesFound
    pub node_names: BTreeSet<String>,
    /// Name of the claim this node belongs to, if any
    pub claim_name: Option<String>,
    /// Node labels (claim labels until the node registers)
    pub labels: BTreeMap<String, String>,
    /// Node taints
    pub taints: Vec<Taint>,
    /// Reported capacity
    pub capacity: ResourceList,
    /// Reported allocatable
    pub allocatable: ResourceList,
    /// Aggregate requests of every pod scheduled here (daemons included)
    pub pod_requests: ResourceList,
    /// Aggregate requests of the daemon-set pods scheduled here
    pub daemon_requests: ResourceList,
    /// Host port reservations
    pub host_ports: HostPortUsage,
    /// Mounted volume tracking
    pub volumes: VolumeUsage,
    /// Attachable volume ceiling, when the node reports one
    pub volume_limit: Option<usize>,
    /// Whether the node's kubelet reports Ready and startup taints are gone
    pub initialized: bool,
    /// Whether deletion has been requested for the node or its claim
    pub marked_for_deletion: bool,
    /// Nomination expiry: the node is expected to receive a recently
    /// scheduled pod and must not be double-counted
    pub nominated_until: Option<Instant>,
}

impl StateNode {
    /// A claim-backed placeholder until the real node registers
    pub fn from_claim(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            node_names: BTreeSet::new(),
            claim_name: None,
            labels: BTreeMap::new(),
            taints: Vec::new(),
            capacity: ResourceList::new(),
            allocatable: ResourceList::new(),
            pod_requests: ResourceList::new(),
            daemon_requests: ResourceList::new(),
            host_ports: HostPortUsage::default(),
            volumes: VolumeUsage::default(),
            volume_limit: None,
            initialized: false,
            marked_for_deletion: false,
            nominated_until: None,
        }
    }

    /// True when this node was launched by gantry
    pub fn owned(&self) -> bool {
        self.labels.contains_key(gantry_common::NODEPOOL_LABEL)
    }

    /// Owning pool name, when owned
    pub fn pool_name(&self) -> Option<&str> {
        self.labels.get(gantry_common::NODEPOOL_LABEL).map(|s| s.as_str())
    }

    /// The registered node name, when exactly one node matched
    pub fn node_name(&self) -> Option<&str> {
        if self.node_names.len() == 1 {
            self.node_names.iter().next().map(|s| s.as_str())
        } else {
            None
        }
    }

    /// Resources still free: allocatable minus everything scheduled
    pub fn available(&self) -> ResourceList {
        resources::subtract_clamped(&self.allocatable, &self.pod_requests)
    }

    /// True while a nomination is outstanding
    pub fn is_nominated(&self) -> bool {
        matches!(self.nominated_until, Some(t) if t > Instant::now())
    }

    /// Record a pod landing on this node
    pub fn add_pod(&mut self, pod_key: &str, pod: &Pod, is_daemon: bool) {
        let requests = resources::pod_requests(pod);
        self.pod_requests = resources::add(&self.pod_requests, &requests);
        if is_daemon {
            self.daemon_requests = resources::add(&self.daemon_requests, &requests);
        }
        self.host_ports.add(pod_key, pod);
        self.volumes.add(pod_key, pod);
    }

    /// Remove a pod's contribution
    pub fn remove_pod(&mut self, pod_key: &str, pod: &Pod, is_daemon: bool) {
        let requests = resources::pod_requests(pod);
        self.pod_requests = resources::subtract_clamped(&self.pod_requests, &requests);
        if is_daemon {
            self.daemon_requests = resources::subtract_clamped(&self.daemon_requests, &requests);
        }
        self.host_ports.remove(pod_key);
        self.volumes.remove(pod_key);
    }
}
