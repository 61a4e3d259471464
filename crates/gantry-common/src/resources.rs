//! Kubernetes resource quantity arithmetic
//!
//! Quantities are carried as `k8s_openapi` [`Quantity`] strings at the API
//! boundary and converted to canonical milli-units (i64) for arithmetic.
//! Milli-units hold CPU ("100m" = 100) and byte quantities ("8Gi" =
//! 8589934592000) without loss for every size a node can realistically have.
//!
//! Admission validates quantities with [`parse_quantity`]; the arithmetic
//! helpers assume validated input and treat anything unparseable as zero so
//! a reconcile pass never fails halfway through a resource computation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::{Error, Result};

/// Resource name for CPU
pub const CPU: &str = "cpu";
/// Resource name for memory
pub const MEMORY: &str = "memory";
/// Resource name for ephemeral storage
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
/// Resource name for the pod count ceiling
pub const PODS: &str = "pods";

/// A named vector of resource quantities
pub type ResourceList = BTreeMap<String, Quantity>;

/// Parse a quantity string into canonical milli-units
///
/// Supports the decimal ("k", "M", "G", "T", "P"), binary ("Ki", "Mi", "Gi",
/// "Ti", "Pi") and milli ("m") suffixes, plain integers, and decimal
/// fractions ("1.5Gi", "0.5").
pub fn parse_quantity(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation("empty quantity"));
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-' && c != '+')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() || number == "-" || number == "+" {
        return Err(Error::validation(format!("invalid quantity {s:?}")));
    }

    // Milli-units per unit of the suffix
    let scale: i128 = match suffix {
        "" => 1_000,
        "m" => 1,
        "k" => 1_000_000,
        "M" => 1_000_000_000,
        "G" => 1_000_000_000_000,
        "T" => 1_000_000_000_000_000,
        "P" => 1_000_000_000_000_000_000,
        "Ki" => 1_024_000,
        "Mi" => 1_048_576_000,
        "Gi" => 1_073_741_824_000,
        "Ti" => 1_099_511_627_776_000,
        "Pi" => 1_125_899_906_842_624_000,
        _ => return Err(Error::validation(format!("unknown quantity suffix {suffix:?}"))),
    };

    let negative = number.starts_with('-');
    let unsigned = number.trim_start_matches(['-', '+']);
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (unsigned, ""),
    };
    let int: i128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| Error::validation(format!("invalid quantity {s:?}")))?
    };
    let frac: f64 = if frac_part.is_empty() {
        0.0
    } else {
        format!("0.{frac_part}")
            .parse()
            .map_err(|_| Error::validation(format!("invalid quantity {s:?}")))?
    };

    let mut millis = int * scale + (frac * scale as f64).round() as i128;
    if negative {
        millis = -millis;
    }
    i64::try_from(millis).map_err(|_| Error::validation(format!("quantity {s:?} overflows")))
}

/// Milli-units of a quantity, treating unparseable input as zero
pub fn millis(q: &Quantity) -> i64 {
    parse_quantity(&q.0).unwrap_or(0)
}

/// Construct a quantity from milli-units
///
/// Whole units render as plain integers; fractional values keep the "m"
/// suffix so no precision is lost on a round trip.
pub fn quantity_from_millis(m: i64) -> Quantity {
    if m % 1_000 == 0 {
        Quantity((m / 1_000).to_string())
    } else {
        Quantity(format!("{m}m"))
    }
}

/// Element-wise sum of two resource lists
pub fn add(lhs: &ResourceList, rhs: &ResourceList) -> ResourceList {
    let mut out = lhs.clone();
    for (k, v) in rhs {
        let sum = millis(out.get(k).unwrap_or(&Quantity("0".into()))) + millis(v);
        out.insert(k.clone(), quantity_from_millis(sum));
    }
    out
}

/// Right-biased merge: values in `overrides` replace values in `base`
pub fn merge(base: &ResourceList, overrides: &ResourceList) -> ResourceList {
    let mut out = base.clone();
    for (k, v) in overrides {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// Element-wise difference over the keys of `lhs`; may go negative
pub fn subtract(lhs: &ResourceList, rhs: &ResourceList) -> ResourceList {
    lhs.iter()
        .map(|(k, v)| {
            let r = rhs.get(k).map(millis).unwrap_or(0);
            (k.clone(), quantity_from_millis(millis(v) - r))
        })
        .collect()
}

/// Element-wise difference clamped at zero per resource
pub fn subtract_clamped(lhs: &ResourceList, rhs: &ResourceList) -> ResourceList {
    lhs.iter()
        .map(|(k, v)| {
            let r = rhs.get(k).map(millis).unwrap_or(0);
            (k.clone(), quantity_from_millis((millis(v) - r).max(0)))
        })
        .collect()
}

/// True when every requested resource fits within `available`
///
/// A resource absent from `available` counts as zero, so any positive
/// request for it fails the fit.
pub fn fits(requests: &ResourceList, available: &ResourceList) -> bool {
    requests.iter().all(|(k, v)| {
        let want = millis(v);
        want <= 0 || want <= available.get(k).map(millis).unwrap_or(0)
    })
}

/// Element-wise maximum across resource lists
pub fn element_max<'a>(lists: impl IntoIterator<Item = &'a ResourceList>) -> ResourceList {
    let mut out: BTreeMap<String, i64> = BTreeMap::new();
    for list in lists {
        for (k, v) in list {
            let m = millis(v);
            out.entry(k.clone())
                .and_modify(|cur| *cur = (*cur).max(m))
                .or_insert(m);
        }
    }
    out.into_iter()
        .map(|(k, m)| (k, quantity_from_millis(m)))
        .collect()
}

/// True when any resource in `capacity` exceeds its entry in `remaining`
///
/// Used to filter instance types against a pool's remaining limits; only
/// keys present in `remaining` constrain.
pub fn exceeds_any(capacity: &ResourceList, remaining: &ResourceList) -> bool {
    remaining
        .iter()
        .any(|(k, limit)| capacity.get(k).map(millis).unwrap_or(0) > millis(limit))
}

/// True when every entry is zero or absent
pub fn is_zero(list: &ResourceList) -> bool {
    list.values().all(|v| millis(v) <= 0)
}

/// Effective resource requests of a single pod
///
/// Per the scheduling contract, the effective request per resource is
/// `max(max(init containers), sum(app containers))`, plus any declared pod
/// overhead.
pub fn pod_requests(pod: &Pod) -> ResourceList {
    let spec = match &pod.spec {
        Some(s) => s,
        None => return ResourceList::new(),
    };
    let mut totals: BTreeMap<String, i64> = BTreeMap::new();
    for container in &spec.containers {
        if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            for (k, v) in requests {
                *totals.entry(k.clone()).or_insert(0) += millis(v);
            }
        }
    }
    for init in spec.init_containers.iter().flatten() {
        if let Some(requests) = init.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            for (k, v) in requests {
                let m = millis(v);
                totals
                    .entry(k.clone())
                    .and_modify(|cur| *cur = (*cur).max(m))
                    .or_insert(m);
            }
        }
    }
    if let Some(overhead) = &spec.overhead {
        for (k, v) in overhead {
            *totals.entry(k.clone()).or_insert(0) += millis(v);
        }
    }
    totals
        .into_iter()
        .map(|(k, m)| (k, quantity_from_millis(m)))
        .collect()
}

/// Summed effective requests across pods
pub fn requests_for_pods<'a>(pods: impl IntoIterator<Item = &'a Pod>) -> ResourceList {
    let mut out = ResourceList::new();
    for pod in pods {
        out = add(&out, &pod_requests(pod));
    }
    out
}

/// Render a resource list for log output, e.g. `cpu: 210m, memory: 1465Mi`
pub fn display(list: &ResourceList) -> String {
    list.iter()
        .map(|(k, v)| format!("{k}: {}", v.0))
        .collect::<Vec<_>>()
        .join(", ")
}
