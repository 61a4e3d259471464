//! A single label requirement under the six node-selector operators
//!
//! Requirements are stored as a complement set plus optional integer bounds,
//! which lets intersection distribute over every operator pair:
//!
//! | operator     | complement | values        | bounds |
//! |--------------|-----------|----------------|--------|
//! | In           | false     | allowed values | -      |
//! | NotIn        | true      | denied values  | -      |
//! | Exists       | true      | {}             | -      |
//! | DoesNotExist | false     | {}             | -      |
//! | Gt n         | true      | {}             | (n, ∞) |
//! | Lt n         | true      | {}             | (-∞, n)|

use std::collections::BTreeSet;

use gantry_common::crd::RequirementSpec;

/// Node selector operator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    /// Value must be one of the listed values
    In,
    /// Value must not be one of the listed values
    NotIn,
    /// The label must be present
    Exists,
    /// The label must be absent
    DoesNotExist,
    /// The label parses as an integer greater than the bound
    Gt,
    /// The label parses as an integer less than the bound
    Lt,
}

/// One label requirement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    complement: bool,
    values: BTreeSet<String>,
    greater_than: Option<i64>,
    less_than: Option<i64>,
}

impl Requirement {
    /// Construct a requirement from an operator and values
    ///
    /// For `Gt`/`Lt` the first value must be an integer string; callers
    /// validate this at admission ([`RequirementSpec::validate`]).
    pub fn new<I, S>(key: impl Into<String>, operator: Operator, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        match operator {
            Operator::In => Self {
                key,
                complement: false,
                values,
                greater_than: None,
                less_than: None,
            },
            Operator::NotIn => Self {
                key,
                complement: true,
                values,
                greater_than: None,
                less_than: None,
            },
            Operator::Exists => Self {
                key,
                complement: true,
                values: BTreeSet::new(),
                greater_than: None,
                less_than: None,
            },
            Operator::DoesNotExist => Self {
                key,
                complement: false,
                values: BTreeSet::new(),
                greater_than: None,
                less_than: None,
            },
            Operator::Gt | Operator::Lt => {
                let bound = values
                    .iter()
                    .next()
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                Self {
                    key,
                    complement: true,
                    values: BTreeSet::new(),
                    greater_than: (operator == Operator::Gt).then_some(bound),
                    less_than: (operator == Operator::Lt).then_some(bound),
                }
            }
        }
    }

    /// Construct from the CRD representation
    pub fn from_spec(spec: &RequirementSpec) -> Self {
        let operator = match spec.operator.as_str() {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            "Gt" => Operator::Gt,
            "Lt" => Operator::Lt,
            // admission rejects anything else; an unknown operator that
            // slipped through matches nothing rather than everything
            _ => return Self::new(spec.key.clone(), Operator::In, Vec::<String>::new()),
        };
        Self::new(spec.key.clone(), operator, spec.values.iter().cloned())
    }

    /// Render back to the CRD representation
    pub fn to_spec(&self) -> RequirementSpec {
        let (operator, values) = match self.operator() {
            Operator::In => ("In", self.values.iter().cloned().collect()),
            Operator::NotIn => ("NotIn", self.values.iter().cloned().collect()),
            Operator::Exists => ("Exists", vec![]),
            Operator::DoesNotExist => ("DoesNotExist", vec![]),
            Operator::Gt => ("Gt", vec![self.greater_than.unwrap_or(0).to_string()]),
            Operator::Lt => ("Lt", vec![self.less_than.unwrap_or(0).to_string()]),
        };
        RequirementSpec {
            key: self.key.clone(),
            operator: operator.to_string(),
            values,
        }
    }

    /// The label key this requirement constrains
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reconstruct the closest operator for display and serialization
    pub fn operator(&self) -> Operator {
        if self.complement {
            if self.greater_than.is_some() && self.less_than.is_none() {
                Operator::Gt
            } else if self.less_than.is_some() && self.greater_than.is_none() {
                Operator::Lt
            } else if self.values.is_empty() {
                Operator::Exists
            } else {
                Operator::NotIn
            }
        } else if self.values.is_empty() {
            Operator::DoesNotExist
        } else {
            Operator::In
        }
    }

    fn within_bounds(&self, value: &str) -> bool {
        if self.greater_than.is_none() && self.less_than.is_none() {
            return true;
        }
        let Ok(n) = value.parse::<i64>() else {
            return false;
        };
        self.greater_than.map(|b| n > b).unwrap_or(true)
            && self.less_than.map(|b| n < b).unwrap_or(true)
    }

    /// True when the given label value satisfies this requirement
    pub fn has(&self, value: &str) -> bool {
        if self.complement {
            !self.values.contains(value) && self.within_bounds(value)
        } else {
            self.values.contains(value) && self.within_bounds(value)
        }
    }

    /// Number of allowed values; `None` means unbounded (complement form)
    pub fn count(&self) -> Option<usize> {
        if self.complement {
            None
        } else {
            Some(self.values.len())
        }
    }

    /// True when no value can satisfy this requirement
    pub fn is_unsatisfiable(&self) -> bool {
        if self.complement {
            // an empty integer interval is the only way a complement dies
            matches!(
                (self.greater_than, self.less_than),
                (Some(gt), Some(lt)) if gt + 1 >= lt
            )
        } else {
            self.values.is_empty() && self.operator() != Operator::DoesNotExist
        }
    }

    /// The single allowed value, when the requirement has collapsed to one
    pub fn single_value(&self) -> Option<&str> {
        if !self.complement && self.values.len() == 1 {
            self.values.iter().next().map(|s| s.as_str())
        } else {
            None
        }
    }

    /// Deterministic representative value (the smallest), used for tie-break
    /// decisions that must be stable across runs
    pub fn any(&self) -> Option<&str> {
        if self.complement {
            None
        } else {
            self.values.iter().next().map(|s| s.as_str())
        }
    }

    /// Iterate the allowed values of a non-complement requirement
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|s| s.as_str())
    }

    /// Intersect two requirements on the same key
    pub fn intersection(&self, other: &Self) -> Self {
        debug_assert_eq!(self.key, other.key);
        let greater_than = match (self.greater_than, other.greater_than) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let less_than = match (self.less_than, other.less_than) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let (complement, values) = match (self.complement, other.complement) {
            // NotIn ∩ NotIn: union of exclusions
            (true, true) => (true, self.values.union(&other.values).cloned().collect()),
            // In ∩ NotIn: allowlist minus denylist
            (false, true) => (
                false,
                self.values.difference(&other.values).cloned().collect(),
            ),
            (true, false) => (
                false,
                other.values.difference(&self.values).cloned().collect(),
            ),
            // In ∩ In
            (false, false) => (
                false,
                self.values.intersection(&other.values).cloned().collect(),
            ),
        };

        let mut result = Self {
            key: self.key.clone(),
            complement,
            values,
            greater_than,
            less_than,
        };
        // keep the allowlist consistent with the merged bounds
        if !result.complement && (result.greater_than.is_some() || result.less_than.is_some()) {
            let bounds = Self {
                values: BTreeSet::new(),
                ..result.clone()
            };
            result.values.retain(|v| bounds.within_bounds(v));
            result.greater_than = None;
            result.less_than = None;
        }
        result
    }

    /// True when some value satisfies both requirements
    pub fn intersects(&self, other: &Self) -> bool {
        let merged = self.intersection(other);
        if merged.complement {
            !merged.is_unsatisfiable()
        } else {
            !merged.values.is_empty()
        }
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.operator() {
            Operator::In => write!(f, "{} In {:?}", self.key, self.values),
            Operator::NotIn => write!(f, "{} NotIn {:?}", self.key, self.values),
            Operator::Exists => write!(f, "{} Exists", self.key),
            Operator::DoesNotExist => write!(f, "{} DoesNotExist", self.key),
            Operator::Gt => write!(f, "{} Gt {}", self.key, self.greater_than.unwrap_or(0)),
            Operator::Lt => write!(f, "{} Lt {}", self.key, self.less_than.unwrap_or(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(op: Operator, values: &[&str]) -> Requirement {
        Requirement::new("key", op, values.iter().copied())
    }

    #[test]
    fn operators_round_trip() {
        for (op, values) in [
            (Operator::In, vec!["a", "b"]),
            (Operator::NotIn, vec!["a"]),
            (Operator::Exists, vec![]),
            (Operator::DoesNotExist, vec![]),
            (Operator::Gt, vec!["5"]),
            (Operator::Lt, vec!["5"]),
        ] {
            assert_eq!(req(op, &values).operator(), op);
        }
    }

    #[test]
    fn in_intersection_distributes() {
        let ab = req(Operator::In, &["a", "b"]);
        let bc = req(Operator::In, &["b", "c"]);
        let merged = ab.intersection(&bc);
        assert_eq!(merged.single_value(), Some("b"));
        assert!(ab.intersects(&bc));
    }

    #[test]
    fn in_and_not_in_subtracts() {
        let ab = req(Operator::In, &["a", "b"]);
        let not_a = req(Operator::NotIn, &["a"]);
        let merged = ab.intersection(&not_a);
        assert_eq!(merged.single_value(), Some("b"));

        let not_both = req(Operator::NotIn, &["a", "b"]);
        assert!(!ab.intersects(&not_both));
    }

    #[test]
    fn not_in_pairs_always_intersect() {
        let x = req(Operator::NotIn, &["a"]);
        let y = req(Operator::NotIn, &["b"]);
        assert!(x.intersects(&y));
        assert_eq!(x.intersection(&y).operator(), Operator::NotIn);
    }

    #[test]
    fn exists_is_identity_for_intersection() {
        let any = req(Operator::Exists, &[]);
        let ab = req(Operator::In, &["a", "b"]);
        assert_eq!(any.intersection(&ab), ab);
        assert!(any.has("anything"));
    }

    #[test]
    fn bounds_filter_allowlists() {
        let sizes = req(Operator::In, &["2", "4", "8"]);
        let gt3 = req(Operator::Gt, &["3"]);
        let merged = sizes.intersection(&gt3);
        assert_eq!(merged.count(), Some(2));
        assert!(merged.has("4"));
        assert!(!merged.has("2"));
    }

    #[test]
    fn empty_integer_interval_is_unsatisfiable() {
        let gt5 = req(Operator::Gt, &["5"]);
        let lt3 = req(Operator::Lt, &["3"]);
        assert!(!gt5.intersects(&lt3));
        assert!(gt5.intersection(&lt3).is_unsatisfiable());

        // adjacent bounds leave no integer either: x > 4 && x < 5
        let gt4 = req(Operator::Gt, &["4"]);
        let lt5 = req(Operator::Lt, &["5"]);
        assert!(!gt4.intersects(&lt5));
    }

    #[test]
    fn gt_matches_only_larger_integers() {
        let gt5 = req(Operator::Gt, &["5"]);
        assert!(gt5.has("6"));
        assert!(!gt5.has("5"));
        assert!(!gt5.has("not-a-number"));
    }

    #[test]
    fn does_not_exist_is_satisfiable_but_valueless() {
        let dne = req(Operator::DoesNotExist, &[]);
        assert!(!dne.is_unsatisfiable());
        assert!(!dne.has("a"));
        assert_eq!(dne.count(), Some(0));
    }

    #[test]
    fn any_is_deterministic_smallest() {
        let r = req(Operator::In, &["zone-b", "zone-a", "zone-c"]);
        assert_eq!(r.any(), Some("zone-a"));
    }

    #[test]
    fn spec_round_trip() {
        let spec = RequirementSpec {
            key: "topology.kubernetes.io/zone".into(),
            operator: "In".into(),
            values: vec!["zone-a".into(), "zone-b".into()],
        };
        let r = Requirement::from_spec(&spec);
        let back = r.to_spec();
        assert_eq!(back.key, spec.key);
        assert_eq!(back.operator, "In");
        assert_eq!(back.values, spec.values);
    }
}
