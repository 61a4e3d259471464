//! Cloud provider adapter contract for Gantry
//!
//! The provider is opaque: an instance-type catalog plus create/get/list/
//! delete/is-drifted operations on claims. Everything else in the system
//! talks to this trait, so tests run against [`fake::FakeCloudProvider`].

#![deny(missing_docs)]

pub mod fake;
pub mod instance_type;
pub mod overhead;
pub mod unavailable_offerings;

use async_trait::async_trait;
use thiserror::Error;

use gantry_common::crd::{NodeClaim, NodePool};

pub use instance_type::{InstanceType, Offering, Overhead, ON_DEMAND, SPOT};
pub use unavailable_offerings::UnavailableOfferings;

/// Why a claim's instance no longer matches its desired configuration
pub type DriftReason = String;

/// Errors surfaced by cloud provider adapters
#[derive(Debug, Error)]
pub enum CloudProviderError {
    /// The provider had no capacity for the chosen offering
    #[error("insufficient capacity for {instance_type} in {zone} ({capacity_type})")]
    InsufficientCapacity {
        /// Instance type that could not be launched
        instance_type: String,
        /// Zone the launch was attempted in
        zone: String,
        /// Purchase option
        capacity_type: String,
    },

    /// The instance does not exist
    #[error("instance {provider_id} not found")]
    NotFound {
        /// Provider-id that failed to resolve
        provider_id: String,
    },

    /// The instance exists but belongs to another owner
    #[error("instance {provider_id} not owned by this cluster")]
    NotOwned {
        /// Provider-id of the foreign instance
        provider_id: String,
    },

    /// A transient provider failure worth retrying
    #[error("cloud provider error: {message}")]
    Transient {
        /// What failed
        message: String,
    },

    /// A provider failure that will not succeed on retry
    #[error("cloud provider error (permanent): {message}")]
    Permanent {
        /// What failed
        message: String,
    },
}

impl CloudProviderError {
    /// True for 404-equivalent responses
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the error is an insufficient-capacity rejection
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. })
    }

    /// True when a retry may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// The opaque cloud provider adapter
///
/// Implementations must be idempotent where the contract says so: `delete`
/// succeeds on an already-gone instance, and `create` for an existing claim
/// name may return the existing instance.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// The catalog of launchable instance types, optionally narrowed to what
    /// a pool's node class permits
    async fn get_instance_types(
        &self,
        pool: Option<&NodePool>,
    ) -> Result<Vec<InstanceType>, CloudProviderError>;

    /// Launch an instance for the claim
    ///
    /// Returns the claim enriched with provider-id, resolved labels, and
    /// reported capacity/allocatable.
    async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim, CloudProviderError>;

    /// Fetch the claim representation of a running instance
    async fn get(&self, provider_id: &str) -> Result<NodeClaim, CloudProviderError>;

    /// List the claim representations of all owned instances
    async fn list(&self) -> Result<Vec<NodeClaim>, CloudProviderError>;

    /// Terminate the claim's instance; success on not-found
    async fn delete(&self, claim: &NodeClaim) -> Result<(), CloudProviderError>;

    /// Whether the claim's instance has drifted from its desired
    /// configuration, and why
    async fn is_drifted(&self, claim: &NodeClaim)
        -> Result<Option<DriftReason>, CloudProviderError>;
}
