//! Error types for the Gantry controllers
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the context a reconciler has at the failure site: claim
//! names, pool names, instance types and zones.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Gantry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs or settings
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.template.spec.kubelet.maxPods")
        field: Option<String>,
    },

    /// Cloud provider error
    #[error("cloud provider error for {claim}: {message}")]
    CloudProvider {
        /// Name of the claim being acted on
        claim: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// The cloud provider had no capacity for a specific offering
    #[error("insufficient capacity for {instance_type} in {zone} ({capacity_type})")]
    InsufficientCapacity {
        /// Instance type that could not be launched
        instance_type: String,
        /// Zone the launch was attempted in
        zone: String,
        /// Purchase option (on-demand, spot)
        capacity_type: String,
    },

    /// A claim matched more than one node; the invariant is surfaced, not repaired
    #[error("claim {claim} matched multiple nodes: {nodes:?}")]
    MultipleNodesFound {
        /// Name of the claim
        claim: String,
        /// Names of the conflicting nodes
        nodes: Vec<String>,
    },

    /// Cluster state projection error
    #[error("state error [{context}]: {message}")]
    State {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "sync", "nomination")
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "scheduler", "batcher")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable cloud provider error
    pub fn cloud_provider(claim: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CloudProvider {
            claim: claim.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable cloud provider error (e.g., malformed node class)
    pub fn cloud_provider_permanent(claim: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CloudProvider {
            claim: claim.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a state error with context
    pub fn state(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::State {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the underlying kube error is a 404
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// True when the underlying kube error is a 409 write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409
        )
    }

    /// Check if this error is retryable
    ///
    /// Validation errors are not retryable (require a config fix).
    /// Insufficient capacity is not retryable in the short term: the claim is
    /// replaced rather than relaunched. Conflicts retry with a fresh read.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry transient K8s errors plus 409 conflicts; other 4xx
                // responses need a spec change, not a retry.
                matches!(source, kube::Error::Api(ae) if ae.code == 409)
                    || !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
            Error::Validation { .. } => false,
            Error::CloudProvider { retryable, .. } => *retryable,
            Error::InsufficientCapacity { .. } => false,
            Error::MultipleNodesFound { .. } => false,
            Error::State { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the claim name if this error is associated with a specific claim
    pub fn claim(&self) -> Option<&str> {
        match self {
            Error::CloudProvider { claim, .. } => Some(claim),
            Error::MultipleNodesFound { claim, .. } => Some(claim),
            _ => None,
        }
    }
}

/// Truncate a message for storage in a status condition
///
/// Condition messages are capped so a pathological provider error cannot
/// bloat the object past etcd limits.
pub fn truncate_message(msg: &str) -> String {
    const MAX: usize = 300;
    if msg.len() <= MAX {
        return msg.to_string();
    }
    let mut end = MAX;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &msg[..end])
}
