//! Per-pod scheduling incompatibilities
//!
//! These are not operator errors: they are the reasons a particular pod does
//! not fit a particular candidate, accumulated and surfaced per pod in the
//! scheduling results.

use thiserror::Error;

/// Why a pod cannot be placed on a candidate node or claim
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SchedulingError {
    /// The pod does not tolerate a taint on the candidate
    #[error("untolerated taint {key}={value}:{effect}")]
    UntoleratedTaint {
        /// Taint key
        key: String,
        /// Taint value (empty when unset)
        value: String,
        /// Taint effect
        effect: String,
    },

    /// The pod requires a label the candidate has no known values for
    #[error("label {key:?} does not have known values{hint}")]
    UnknownLabel {
        /// The unresolvable label key
        key: String,
        /// Optional did-you-mean suffix
        hint: String,
    },

    /// Requirements on a shared key have no common value
    #[error("key {key}, {incoming} not in {existing}")]
    EmptyIntersection {
        /// The conflicting key
        key: String,
        /// Incoming requirement, rendered
        incoming: String,
        /// Existing requirement, rendered
        existing: String,
    },

    /// No term of a flexible (OR-of-AND) requirement set is compatible
    #[error("no node affinity term is compatible")]
    NoCompatibleTerms,

    /// A host port the pod needs is already claimed on the candidate
    #[error("host port {host_ip}:{port}/{protocol} already in use")]
    HostPortConflict {
        /// Host IP the port binds to
        host_ip: String,
        /// Conflicting port number
        port: i32,
        /// Port protocol
        protocol: String,
    },

    /// Mounting the pod's volumes would exceed the candidate's volume limits
    #[error("would exceed node volume limits ({requested} > {limit})")]
    VolumeLimitExceeded {
        /// Volumes that would be mounted
        requested: usize,
        /// The candidate's limit
        limit: usize,
    },

    /// The pod's requests do not fit the candidate's remaining resources
    #[error("exceeds node resources for {resource}")]
    ExceedsResources {
        /// First resource that did not fit
        resource: String,
    },

    /// Topology constraints leave no admissible domain
    #[error("no admissible domains for topology key {key:?}")]
    NoTopologyDomains {
        /// The topology key with no viable domain
        key: String,
    },

    /// A persistent volume claim could not be resolved
    #[error("volume {volume}: {message}")]
    VolumeResolution {
        /// Volume name on the pod
        volume: String,
        /// What failed
        message: String,
    },
}
