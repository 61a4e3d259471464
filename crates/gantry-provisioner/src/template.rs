//! Claim templates derived from NodePools
//!
//! A template is the scheduler-local distillation of one pool: its base
//! requirements, taints, kubelet configuration, weight, and the hash used
//! for static drift detection.

use std::collections::BTreeMap;

use kube::ResourceExt;

use gantry_common::crd::{
    KubeletConfiguration, NodeClassReference, NodePool, TaintSpec,
};
use gantry_common::NODEPOOL_LABEL;
use gantry_scheduling::{Operator, Requirement, Requirements};

/// Scheduler-local view of one NodePool
#[derive(Clone, Debug)]
pub struct ClaimTemplate {
    /// Owning pool name
    pub pool_name: String,
    /// Pool weight; higher tried first
    pub weight: i32,
    /// Labels stamped onto claims and nodes
    pub labels: BTreeMap<String, String>,
    /// Annotations stamped onto claims
    pub annotations: BTreeMap<String, String>,
    /// Base requirements (pool requirements + template labels + pool label)
    pub requirements: Requirements,
    /// Lifetime taints
    pub taints: Vec<TaintSpec>,
    /// Startup taints removed by an agent once the node is ready
    pub startup_taints: Vec<TaintSpec>,
    /// Kubelet configuration affecting capacity derivation
    pub kubelet: Option<KubeletConfiguration>,
    /// Cloud-provider node class to launch from
    pub node_class_ref: NodeClassReference,
    /// Hash of the pool template at scheduling time
    pub template_hash: String,
}

impl ClaimTemplate {
    /// Build the template for a pool
    pub fn from_pool(pool: &NodePool) -> Self {
        let pool_name = pool.name_any();
        let template = &pool.spec.template;

        let mut labels = template.metadata.labels.clone();
        labels.insert(NODEPOOL_LABEL.to_string(), pool_name.clone());

        let mut requirements = Requirements::from_specs(&template.spec.requirements);
        for (key, value) in &labels {
            requirements.add(Requirement::new(key.clone(), Operator::In, [value.clone()]));
        }

        Self {
            pool_name,
            weight: pool.weight(),
            labels,
            annotations: template.metadata.annotations.clone(),
            requirements,
            taints: template.spec.taints.clone(),
            startup_taints: template.spec.startup_taints.clone(),
            kubelet: template.spec.kubelet.clone(),
            node_class_ref: template.spec.node_class_ref.clone(),
            template_hash: pool.spec.template_hash(),
        }
    }

    /// All taints a daemon pod must tolerate to schedule on this template
    pub fn all_taints(&self) -> Vec<k8s_openapi::api::core::v1::Taint> {
        gantry_scheduling::taints::from_specs(self.taints.iter().chain(&self.startup_taints))
    }
}

/// Sort templates by weight descending, name ascending on ties
pub fn order_templates(templates: &mut [std::sync::Arc<ClaimTemplate>]) {
    templates.sort_by(|a, b| {
        b.weight
            .cmp(&a.weight)
            .then_with(|| a.pool_name.cmp(&b.pool_name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_common::crd::{NodeClaimSpec, NodeClaimTemplateSpec, NodePoolSpec, RequirementSpec, TemplateMetadata};
    use std::sync::Arc;

    fn pool(name: &str, weight: Option<i32>) -> NodePool {
        NodePool::new(
            name,
            NodePoolSpec {
                template: NodeClaimTemplateSpec {
                    metadata: TemplateMetadata {
                        labels: BTreeMap::from([("team".to_string(), "search".to_string())]),
                        ..Default::default()
                    },
                    spec: NodeClaimSpec {
                        requirements: vec![RequirementSpec {
                            key: "kubernetes.io/arch".into(),
                            operator: "In".into(),
                            values: vec!["amd64".into()],
                        }],
                        ..Default::default()
                    },
                },
                weight,
                ..Default::default()
            },
        )
    }

    #[test]
    fn template_merges_labels_into_requirements() {
        let template = ClaimTemplate::from_pool(&pool("default", None));
        assert_eq!(
            template.requirements.get(NODEPOOL_LABEL).single_value(),
            Some("default")
        );
        assert_eq!(template.requirements.get("team").single_value(), Some("search"));
        assert_eq!(
            template.requirements.get("kubernetes.io/arch").single_value(),
            Some("amd64")
        );
    }

    #[test]
    fn templates_order_by_weight_then_name() {
        let mut templates = vec![
            Arc::new(ClaimTemplate::from_pool(&pool("b-low", Some(1)))),
            Arc::new(ClaimTemplate::from_pool(&pool("a-low", Some(1)))),
            Arc::new(ClaimTemplate::from_pool(&pool("high", Some(100)))),
        ];
        order_templates(&mut templates);
        let names: Vec<&str> = templates.iter().map(|t| t.pool_name.as_str()).collect();
        assert_eq!(names, ["high", "a-low", "b-low"]);
    }
}
