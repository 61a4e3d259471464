//! NodeClaim Custom Resource Definition
//!
//! A NodeClaim is the desired-state representation of one requested node. The
//! scheduler creates claims, the lifecycle controllers drive them through
//! launch, registration and initialization, and the termination controller
//! deletes them once their cloud instance is confirmed gone.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resources::ResourceList;
use crate::NODEPOOL_LABEL;

use super::types::{
    Condition, ConditionStatus, ConditionType, KubeletConfiguration, NodeClassReference,
    RequirementSpec, TaintSpec,
};

/// Specification for a NodeClaim
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gantry.dev",
    version = "v1",
    kind = "NodeClaim",
    plural = "nodeclaims",
    shortname = "nc",
    status = "NodeClaimStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".metadata.labels.node\\.kubernetes\\.io/instance-type"}"#,
    printcolumn = r#"{"name":"Zone","type":"string","jsonPath":".metadata.labels.topology\\.kubernetes\\.io/zone"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    /// Constraints the launched node must satisfy, narrowed by the scheduler
    /// to the chosen zones, capacity types and instance types
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<RequirementSpec>,

    /// Aggregated resource requests of the pods this claim was created for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceClaim>,

    /// Cloud-provider-specific node class to launch from
    pub node_class_ref: NodeClassReference,

    /// Taints applied to the node for its lifetime
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<TaintSpec>,

    /// Taints applied at launch and removed by an external agent once the
    /// node is ready; initialization waits for their removal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<TaintSpec>,

    /// Kubelet configuration used to derive capacity and overhead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<KubeletConfiguration>,
}

/// Resource requests recorded on a claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaim {
    /// Requested quantities by resource name
    #[serde(default, skip_serializing_if = "ResourceList::is_empty")]
    pub requests: ResourceList,
}

/// Status for a NodeClaim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    /// Cloud identifier of the launched instance; the primary key linking
    /// the claim, the node and the cloud view
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Machine image the instance was launched from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    /// Reported capacity of the launched instance
    #[serde(default, skip_serializing_if = "ResourceList::is_empty")]
    pub capacity: ResourceList,

    /// Reported allocatable of the launched instance
    #[serde(default, skip_serializing_if = "ResourceList::is_empty")]
    pub allocatable: ResourceList,

    /// Name of the registered node, once one has joined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Lifecycle conditions (Launched, Registered, Initialized, Drifted,
    /// Empty, Expired)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeClaimStatus {
    /// Look up a condition by kind
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True when the condition exists with status True
    pub fn is_true(&self, type_: ConditionType) -> bool {
        matches!(self.condition(type_), Some(c) if c.status == ConditionStatus::True)
    }

    /// Upsert a condition, preserving the transition time when the status
    /// did not change
    pub fn set_condition(&mut self, mut condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    /// Mark a condition True with no reason
    pub fn mark_true(&mut self, type_: ConditionType) {
        self.set_condition(Condition::new(type_, ConditionStatus::True));
    }

    /// Mark a condition False with a reason and message
    pub fn mark_false(
        &mut self,
        type_: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.set_condition(
            Condition::new(type_, ConditionStatus::False).with_reason(reason, message),
        );
    }
}

impl NodeClaim {
    /// Owning pool name from the claim's labels
    pub fn pool_name(&self) -> Option<String> {
        self.labels().get(NODEPOOL_LABEL).cloned()
    }

    /// Provider-id once launched
    pub fn provider_id(&self) -> Option<&str> {
        self.status.as_ref()?.provider_id.as_deref()
    }

    /// True when deletion has been requested
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True when the given condition is True on this claim
    pub fn condition_is_true(&self, type_: ConditionType) -> bool {
        self.status
            .as_ref()
            .map(|s| s.is_true(type_))
            .unwrap_or(false)
    }

    /// Transition time of a condition, if present
    pub fn condition_transitioned_at(
        &self,
        type_: ConditionType,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        self.status
            .as_ref()?
            .condition(type_)
            .map(|c| c.last_transition_time)
    }
}
