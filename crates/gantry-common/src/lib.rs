//! Common types for Gantry: CRDs, errors, settings, and resource arithmetic

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod resources;
pub mod retry;
pub mod settings;
pub mod telemetry;

pub use error::Error;
pub use settings::Settings;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Gantry custom resources
pub const API_GROUP: &str = "gantry.dev";

/// Label holding the owning NodePool name on claims and nodes
pub const NODEPOOL_LABEL: &str = "gantry.dev/nodepool";

/// Label holding the purchase option of a launched instance (on-demand, spot)
pub const CAPACITY_TYPE_LABEL: &str = "gantry.dev/capacity-type";

/// Label set on a node once its claim has registered it
pub const REGISTERED_LABEL: &str = "gantry.dev/registered";

/// Label set on a node once its claim considers it initialized
pub const INITIALIZED_LABEL: &str = "gantry.dev/initialized";

/// Finalizer guaranteeing orderly teardown of claims and their nodes
pub const TERMINATION_FINALIZER: &str = "gantry.dev/termination";

/// Annotation recording the hash of the owning pool's template at launch
pub const NODEPOOL_HASH_ANNOTATION: &str = "gantry.dev/nodepool-hash";

/// Annotation opting a pod or node out of voluntary disruption
pub const DO_NOT_DISRUPT_ANNOTATION: &str = "gantry.dev/do-not-disrupt";

/// Upstream label for the concrete instance type of a node
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";

/// Upstream label for the topology zone of a node
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Upstream label for the CPU architecture of a node
pub const ARCH_LABEL: &str = "kubernetes.io/arch";

/// Upstream label for the operating system of a node
pub const OS_LABEL: &str = "kubernetes.io/os";

/// Upstream label for the hostname of a node
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Label excluding a node from load balancer target pools during drain
pub const EXCLUDE_FROM_LB_LABEL: &str = "node.kubernetes.io/exclude-from-external-load-balancers";

/// Taint key Kubernetes applies to cordoned nodes
pub const UNSCHEDULABLE_TAINT_KEY: &str = "node.kubernetes.io/unschedulable";

/// Priority class names whose pods are evicted last during drain
pub const CRITICAL_PRIORITY_CLASSES: [&str; 2] =
    ["system-node-critical", "system-cluster-critical"];

/// Labels whose values the requirement algebra understands without the pod
/// declaring them (they always resolve against instance type offerings).
pub fn well_known_labels() -> std::collections::BTreeSet<&'static str> {
    [
        NODEPOOL_LABEL,
        CAPACITY_TYPE_LABEL,
        INSTANCE_TYPE_LABEL,
        ZONE_LABEL,
        ARCH_LABEL,
        OS_LABEL,
        HOSTNAME_LABEL,
    ]
    .into()
}

/// Label domains that pods and pools may not set requirements on directly
///
/// `gantry.dev/nodepool` and `gantry.dev/capacity-type` stay selectable; the
/// rest of the `gantry.dev` domain is owned by the controllers.
pub fn is_restricted_label(key: &str) -> bool {
    let owned = key == REGISTERED_LABEL || key == INITIALIZED_LABEL;
    let in_domain = key.starts_with("gantry.dev/");
    owned || (in_domain && key != NODEPOOL_LABEL && key != CAPACITY_TYPE_LABEL)
}
