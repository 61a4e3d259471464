//! Metrics registry for Gantry observability
//!
//! Provides OpenTelemetry metrics for:
//! - Provisioning (scheduling duration, claims created, unschedulable pods)
//! - Claim lifecycle (launched, registered, initialized, terminated by reason)
//! - Disruption (evaluation duration, actions, validation failures)
//! - Termination (drain duration, evictions)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Global meter for Gantry metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("gantry"));

// ============================================================================
// Provisioning Metrics
// ============================================================================

/// Histogram of scheduling pass duration
///
/// Labels:
/// - `simulated`: "true" for disruption simulations
pub static SCHEDULING_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("gantry_scheduling_duration_seconds")
        .with_description("Duration of one batched scheduling pass in seconds")
        .with_unit("s")
        .build()
});

/// Counter of pods found unschedulable at the end of a pass
///
/// Labels:
/// - `reason`: resources, taints, affinity, topology, limits
pub static UNSCHEDULABLE_PODS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gantry_unschedulable_pods_total")
        .with_description("Pods that no pool could accommodate")
        .with_unit("{pods}")
        .build()
});

// ============================================================================
// Claim Lifecycle Metrics
// ============================================================================

/// Counter of claims created by the scheduler
///
/// Labels:
/// - `nodepool`: owning pool name
pub static CLAIMS_CREATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gantry_nodeclaims_created_total")
        .with_description("NodeClaims created by scheduling passes")
        .with_unit("{claims}")
        .build()
});

/// Counter of claims launched by the cloud provider
///
/// Labels:
/// - `nodepool`: owning pool name
pub static CLAIMS_LAUNCHED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gantry_nodeclaims_launched_total")
        .with_description("NodeClaims that reached Launched=true")
        .with_unit("{claims}")
        .build()
});

/// Counter of claims registered by a joining node
///
/// Labels:
/// - `nodepool`: owning pool name
pub static CLAIMS_REGISTERED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gantry_nodeclaims_registered_total")
        .with_description("NodeClaims that reached Registered=true")
        .with_unit("{claims}")
        .build()
});

/// Counter of claims terminated, by cause
///
/// Labels:
/// - `nodepool`: owning pool name
/// - `reason`: insufficient_capacity, launch_timeout, registration_timeout,
///   garbage_collected, drift, expiration, emptiness, consolidation, deleted
pub static CLAIMS_TERMINATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gantry_nodeclaims_terminated_total")
        .with_description("NodeClaims deleted, by cause")
        .with_unit("{claims}")
        .build()
});

// ============================================================================
// Disruption Metrics
// ============================================================================

/// Histogram of disruption evaluation duration
///
/// Labels:
/// - `method`: drift, expiration, emptiness, consolidation
pub static DISRUPTION_EVALUATION_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("gantry_disruption_evaluation_duration_seconds")
        .with_description("Duration of disruption candidate evaluation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of disruption actions executed
///
/// Labels:
/// - `method`: drift, expiration, emptiness, consolidation
pub static DISRUPTION_ACTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gantry_disruption_actions_total")
        .with_description("Voluntary disruption actions executed")
        .with_unit("{actions}")
        .build()
});

/// Counter of disruption proposals aborted at validation
///
/// Labels:
/// - `method`: drift, expiration, emptiness, consolidation
pub static DISRUPTION_VALIDATION_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gantry_disruption_validation_failures_total")
        .with_description("Disruption proposals invalidated between proposal and execution")
        .with_unit("{failures}")
        .build()
});

// ============================================================================
// Termination Metrics
// ============================================================================

/// Histogram of node drain duration
pub static DRAIN_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("gantry_node_drain_duration_seconds")
        .with_description("Time from cordon to empty node in seconds")
        .with_unit("s")
        .build()
});

/// Counter of pod evictions attempted during drain
///
/// Labels:
/// - `outcome`: evicted, gone, pdb_blocked, error
pub static EVICTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gantry_evictions_total")
        .with_description("Pod eviction attempts during drain, by outcome")
        .with_unit("{evictions}")
        .build()
});
