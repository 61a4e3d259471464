//! Batched bin-packing scheduler and provisioning controller for Gantry
//!
//! The batcher coalesces pending-pod events into one scheduling pass; the
//! scheduler packs the batch onto existing capacity and a minimal set of new
//! claims; the controller materializes those claims in the store.

#![deny(missing_docs)]

pub mod batcher;
pub mod claim;
pub mod controller;
pub mod existing_node;
pub mod preferences;
pub mod queue;
pub mod scheduler;
pub mod template;

pub use batcher::{batcher, BatchHandle, Batcher};
pub use claim::{InFlightClaim, MAX_INSTANCE_TYPE_OPTIONS};
pub use controller::{KubeProvisionerClient, Provisioner, ProvisionerClient};
pub use existing_node::ExistingNode;
pub use scheduler::{Results, Scheduler, SchedulerInput, SchedulerOptions};
pub use template::ClaimTemplate;
