//! Supporting types shared by the NodePool and NodeClaim CRDs

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Condition kinds tracked on a NodeClaim
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    /// The cloud provider has created an instance for this claim
    Launched,
    /// A node with the claim's provider-id has joined the cluster
    Registered,
    /// The node is ready, startup taints are gone, allocatable covers requests
    Initialized,
    /// The claim's instance no longer matches its desired configuration
    Drifted,
    /// The claim has carried no non-daemon pods for the consolidation window
    Empty,
    /// The claim has outlived its pool's expiry
    Expired,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launched => write!(f, "Launched"),
            Self::Registered => write!(f, "Registered"),
            Self::Initialized => write!(f, "Initialized"),
            Self::Drifted => write!(f, "Drifted"),
            Self::Empty => write!(f, "Empty"),
            Self::Expired => write!(f, "Expired"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Condition has not been evaluated
    #[default]
    Unknown,
}

/// One observed condition on a claim, with its transition timestamp
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Which condition this records
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned between statuses
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(type_: ConditionType, status: ConditionStatus) -> Self {
        Self {
            type_,
            status,
            reason: None,
            message: None,
            last_transition_time: Utc::now(),
        }
    }

    /// Attach a machine-readable reason and message
    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self.message = Some(message.into());
        self
    }
}

/// Node selector requirement carried on pool templates and claims
///
/// Mirrors the upstream `NodeSelectorRequirement` but is owned here so the
/// CRD schema stays under our control and `Gt`/`Lt` values validate at
/// admission.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequirementSpec {
    /// Label key the requirement applies to
    pub key: String,
    /// One of In, NotIn, Exists, DoesNotExist, Gt, Lt
    pub operator: String,
    /// Values for In/NotIn (single integer string for Gt/Lt)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl RequirementSpec {
    /// Validate operator names and Gt/Lt integer values
    pub fn validate(&self, object: &str) -> Result<()> {
        match self.operator.as_str() {
            "In" | "NotIn" => Ok(()),
            "Exists" | "DoesNotExist" => {
                if self.values.is_empty() {
                    Ok(())
                } else {
                    Err(Error::validation_for(
                        object,
                        format!("operator {} takes no values for key {}", self.operator, self.key),
                    ))
                }
            }
            "Gt" | "Lt" => match self.values.as_slice() {
                [v] if v.parse::<i64>().is_ok() => Ok(()),
                _ => Err(Error::validation_for(
                    object,
                    format!(
                        "operator {} requires exactly one integer value for key {}",
                        self.operator, self.key
                    ),
                )),
            },
            other => Err(Error::validation_for(
                object,
                format!("unknown requirement operator {other:?} for key {}", self.key),
            )),
        }
    }
}

/// A node taint carried on pool templates and claims
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaintSpec {
    /// Taint key
    pub key: String,
    /// Taint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// NoSchedule, PreferNoSchedule, or NoExecute
    pub effect: String,
}

/// Kubelet configuration affecting capacity and overhead derivation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfiguration {
    /// Hard cap on pods per node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods: Option<i64>,

    /// Pods-per-vcpu cap; 0 or absent disables the cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_per_core: Option<i64>,

    /// Overrides for system-reserved resources (quantity strings)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub system_reserved: BTreeMap<String, String>,

    /// Overrides for kube-reserved resources (quantity strings)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kube_reserved: BTreeMap<String, String>,

    /// Hard eviction thresholds by signal, absolute ("100Mi") or percentage ("10%")
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub eviction_hard: BTreeMap<String, String>,

    /// Soft eviction thresholds by signal, absolute or percentage
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub eviction_soft: BTreeMap<String, String>,
}

impl KubeletConfiguration {
    /// Validate every configured quantity and threshold at admission
    pub fn validate(&self, object: &str) -> Result<()> {
        for (field, map) in [
            ("systemReserved", &self.system_reserved),
            ("kubeReserved", &self.kube_reserved),
        ] {
            for (resource, value) in map {
                crate::resources::parse_quantity(value).map_err(|_| {
                    Error::validation_for_field(
                        object,
                        format!("spec.template.spec.kubelet.{field}.{resource}"),
                        format!("unparseable quantity {value:?}"),
                    )
                })?;
            }
        }
        for (field, map) in [
            ("evictionHard", &self.eviction_hard),
            ("evictionSoft", &self.eviction_soft),
        ] {
            for (signal, value) in map {
                validate_threshold(value).map_err(|_| {
                    Error::validation_for_field(
                        object,
                        format!("spec.template.spec.kubelet.{field}.{signal}"),
                        format!("unparseable threshold {value:?}"),
                    )
                })?;
            }
        }
        if matches!(self.max_pods, Some(n) if n < 0) {
            return Err(Error::validation_for(object, "maxPods must be non-negative"));
        }
        if matches!(self.pods_per_core, Some(n) if n < 0) {
            return Err(Error::validation_for(object, "podsPerCore must be non-negative"));
        }
        Ok(())
    }
}

fn validate_threshold(value: &str) -> Result<()> {
    if let Some(pct) = value.strip_suffix('%') {
        let p: f64 = pct
            .parse()
            .map_err(|_| Error::validation(format!("invalid percentage {value:?}")))?;
        if !(0.0..=100.0).contains(&p) {
            return Err(Error::validation(format!("percentage {value:?} out of range")));
        }
        return Ok(());
    }
    crate::resources::parse_quantity(value).map(|_| ())
}

/// Reference to a cloud-provider-specific node class object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassReference {
    /// API group of the node class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Kind of the node class
    pub kind: String,
    /// Name of the node class
    pub name: String,
}

/// When a pool's nodes become candidates for consolidation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConsolidationPolicy {
    /// Only nodes carrying no non-daemon pods are consolidated
    WhenEmpty,
    /// Nodes whose pods fit on a strictly cheaper set are also consolidated
    #[default]
    WhenUnderutilized,
}

/// Voluntary disruption configuration for a pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionSpec {
    /// Consolidation trigger policy
    #[serde(default)]
    pub consolidation_policy: ConsolidationPolicy,

    /// How long a node must be empty/underutilized before consolidation
    /// (duration string, e.g. "30s", "5m"); "Never" disables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidate_after: Option<String>,

    /// Node lifetime before the Expired condition is set; "Never" disables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<String>,

    /// Cap on concurrent voluntary disruptions for this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<DisruptionBudget>,
}

/// Cap on concurrent voluntary disruptions
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudget {
    /// Maximum claims this pool may have in voluntary termination at once
    pub max_disruptions: u32,
}

impl DisruptionSpec {
    /// Parsed consolidation window, `None` when unset or "Never"
    pub fn consolidate_after(&self) -> Result<Option<Duration>> {
        parse_optional_duration(self.consolidate_after.as_deref())
    }

    /// Parsed expiry, `None` when unset or "Never"
    pub fn expire_after(&self) -> Result<Option<Duration>> {
        parse_optional_duration(self.expire_after.as_deref())
    }

    /// Concurrent-disruption cap, defaulting to 1
    pub fn max_disruptions(&self) -> u32 {
        self.budget.as_ref().map(|b| b.max_disruptions).unwrap_or(1)
    }

    /// Validate duration strings at admission
    pub fn validate(&self, object: &str) -> Result<()> {
        self.consolidate_after()
            .map_err(|e| Error::validation_for(object, format!("consolidateAfter: {e}")))?;
        self.expire_after()
            .map_err(|e| Error::validation_for(object, format!("expireAfter: {e}")))?;
        Ok(())
    }
}

fn parse_optional_duration(value: Option<&str>) -> Result<Option<Duration>> {
    match value {
        None | Some("Never") => Ok(None),
        Some(s) => parse_duration(s).map(Some),
    }
}

/// Parse a compound duration string such as "90s", "5m", "1h30m", "720h"
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation("empty duration"));
    }
    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut matched = false;
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let value: f64 = number
            .parse()
            .map_err(|_| Error::validation(format!("invalid duration {s:?}")))?;
        let unit = match c {
            's' => 1.0,
            'm' => 60.0,
            'h' => 3_600.0,
            'd' => 86_400.0,
            _ => return Err(Error::validation(format!("unknown duration unit {c:?} in {s:?}"))),
        };
        total += Duration::from_secs_f64(value * unit);
        number.clear();
        matched = true;
    }
    if !number.is_empty() || !matched {
        return Err(Error::validation(format!("duration {s:?} missing unit")));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_duration("720h").unwrap(), Duration::from_secs(2_592_000));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn disruption_never_disables_windows() {
        let spec = DisruptionSpec {
            consolidate_after: Some("Never".into()),
            expire_after: Some("720h".into()),
            ..Default::default()
        };
        assert_eq!(spec.consolidate_after().unwrap(), None);
        assert_eq!(
            spec.expire_after().unwrap(),
            Some(Duration::from_secs(2_592_000))
        );
        assert_eq!(spec.max_disruptions(), 1);
    }

    #[test]
    fn requirement_spec_validates_operators() {
        let ok = RequirementSpec {
            key: "kubernetes.io/arch".into(),
            operator: "In".into(),
            values: vec!["amd64".into()],
        };
        assert!(ok.validate("pool").is_ok());

        let gt = RequirementSpec {
            key: "gantry.dev/pool-generation".into(),
            operator: "Gt".into(),
            values: vec!["3".into()],
        };
        assert!(gt.validate("pool").is_ok());

        let bad_gt = RequirementSpec {
            key: "k".into(),
            operator: "Gt".into(),
            values: vec!["three".into()],
        };
        assert!(bad_gt.validate("pool").is_err());

        let bad_op = RequirementSpec {
            key: "k".into(),
            operator: "Matches".into(),
            values: vec![],
        };
        assert!(bad_op.validate("pool").is_err());
    }

    #[test]
    fn kubelet_config_rejects_unparseable_thresholds() {
        let mut cfg = KubeletConfiguration::default();
        cfg.eviction_hard
            .insert("memory.available".into(), "10%".into());
        assert!(cfg.validate("pool").is_ok());

        cfg.eviction_hard
            .insert("nodefs.available".into(), "10q".into());
        assert!(cfg.validate("pool").is_err());
    }

    #[test]
    fn condition_display_matches_api_casing() {
        assert_eq!(ConditionType::Launched.to_string(), "Launched");
        assert_eq!(ConditionType::Expired.to_string(), "Expired");
    }
}
