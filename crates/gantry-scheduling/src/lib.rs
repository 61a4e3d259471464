//! Scheduling primitives for Gantry: requirement algebra, taints, and
//! topology tracking
//!
//! These types carry no I/O. The provisioner and disruption crates drive
//! them with cluster state snapshots.

#![deny(missing_docs)]

pub mod error;
pub mod requirement;
pub mod requirements;
pub mod taints;
pub mod topology;
pub mod volume_topology;

pub use error::SchedulingError;
pub use requirement::{Operator, Requirement};
pub use requirements::{pod_requirements, FlexibleRequirements, Requirements};
pub use topology::{pod_key, selector_matches, Topology, TopologyGroup, TopologyKind};
