//! Custom Resource Definitions for Gantry
//!
//! Two cluster-scoped kinds: `NodePool` (templates and limits for
//! provisioning) and `NodeClaim` (the desired-state record of one node).

mod node_claim;
mod node_pool;
mod types;

pub use node_claim::{NodeClaim, NodeClaimSpec, NodeClaimStatus, ResourceClaim};
pub use node_pool::{NodeClaimTemplateSpec, NodePool, NodePoolSpec, NodePoolStatus, TemplateMetadata};
pub use types::{
    parse_duration, Condition, ConditionStatus, ConditionType, ConsolidationPolicy,
    DisruptionBudget, DisruptionSpec, KubeletConfiguration, NodeClassReference, RequirementSpec,
    TaintSpec,
};
