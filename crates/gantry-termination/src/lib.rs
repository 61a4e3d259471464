//! Node drain and claim teardown for Gantry
//!
//! Cordon the node, evict its workload pods through a rate-limited queue,
//! delete the cloud instance, and remove the claim's finalizer last.

#![deny(missing_docs)]

pub mod controller;
pub mod eviction;
pub mod terminator;

pub use controller::{
    error_policy, reconcile, Context, KubeTerminationClaimClient, TerminationClaimClient,
};
pub use eviction::{EvictionClient, EvictionQueue, EvictionResponse, KubeEvictionClient};
pub use terminator::{
    drain_complete, DrainStatus, KubeTerminationClient, TerminationClient, Terminator,
};
