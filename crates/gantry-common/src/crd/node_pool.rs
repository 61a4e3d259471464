//! NodePool Custom Resource Definition
//!
//! A NodePool owns a template for the node claims the scheduler may create,
//! a resource ceiling on cumulative provisioned capacity, a weight for
//! ordering among pools, and the pool's voluntary-disruption configuration.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resources::ResourceList;
use crate::{is_restricted_label, Result};

use super::node_claim::NodeClaimSpec;
use super::types::DisruptionSpec;

/// Specification for a NodePool
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gantry.dev",
    version = "v1",
    kind = "NodePool",
    plural = "nodepools",
    shortname = "np",
    status = "NodePoolStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Weight","type":"integer","jsonPath":".spec.weight"}"#,
    printcolumn = r#"{"name":"CPU","type":"string","jsonPath":".status.resources.cpu"}"#,
    printcolumn = r#"{"name":"Memory","type":"string","jsonPath":".status.resources.memory"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Template for claims created on behalf of this pool
    pub template: NodeClaimTemplateSpec,

    /// Ceiling on cumulative provisioned capacity across the pool's nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// Priority among pools; higher weight is tried first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,

    /// Voluntary-disruption configuration
    #[serde(default)]
    pub disruption: DisruptionSpec,
}

/// Claim template carried by a pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimTemplateSpec {
    /// Labels and annotations stamped onto created claims and their nodes
    #[serde(default)]
    pub metadata: TemplateMetadata,

    /// Claim spec fields (requirements, taints, kubelet, node class)
    pub spec: NodeClaimSpec,
}

/// Metadata stamped onto created claims
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Labels for created claims and nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations for created claims and nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Status for a NodePool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Cumulative capacity of nodes currently provisioned for this pool
    #[serde(default, skip_serializing_if = "ResourceList::is_empty")]
    pub resources: ResourceList,
}

impl NodePoolSpec {
    /// Validate the pool specification at admission
    pub fn validate(&self, name: &str) -> Result<()> {
        for requirement in &self.template.spec.requirements {
            requirement.validate(name)?;
            if is_restricted_label(&requirement.key) {
                return Err(crate::Error::validation_for_field(
                    name,
                    "spec.template.spec.requirements",
                    format!("label {} is restricted", requirement.key),
                ));
            }
        }
        for key in self.template.metadata.labels.keys() {
            if is_restricted_label(key) {
                return Err(crate::Error::validation_for_field(
                    name,
                    "spec.template.metadata.labels",
                    format!("label {key} is restricted"),
                ));
            }
        }
        if let Some(kubelet) = &self.template.spec.kubelet {
            kubelet.validate(name)?;
        }
        self.disruption.validate(name)?;
        Ok(())
    }

    /// Stable hash of the template, recorded on claims at launch
    ///
    /// A claim whose recorded hash differs from its pool's current hash is
    /// statically drifted: the pool changed underneath it.
    pub fn template_hash(&self) -> String {
        let serialized =
            serde_json::to_string(&self.template).unwrap_or_default();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        serialized.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

impl NodePool {
    /// Priority of this pool; pools with no weight sort last
    pub fn weight(&self) -> i32 {
        self.spec.weight.unwrap_or(0)
    }
}
