//! NodeClaim lifecycle reconcilers for Gantry
//!
//! A claim moves Pending → Launched → Registered → Initialized, may be
//! marked Drifted/Empty/Expired along the way, and is garbage collected if
//! its cloud instance orphans or vanishes. Every reconciler is idempotent;
//! the aggregate controller persists status once per pass.

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod garbage_collection;
pub mod initialization;
pub mod launch;
pub mod liveness;
pub mod marking;
pub mod registration;

use std::time::Duration;

pub use client::{KubeLifecycleClient, LifecycleClient};
pub use controller::{error_policy, reconcile, Context};
pub use garbage_collection::{GarbageCollector, GC_INTERVAL};
pub use initialization::Initialization;
pub use launch::Launch;
pub use liveness::{Liveness, LAUNCH_TTL, REGISTRATION_TTL};
pub use marking::{Marking, DRIFT_CHECK_INTERVAL};
pub use registration::Registration;

/// What one sub-reconciler pass decided
#[derive(Clone, Copy, Debug, Default)]
pub struct Outcome {
    /// Re-run no later than this
    pub requeue_after: Option<Duration>,
    /// The claim was deleted; stop processing it
    pub deleted: bool,
}

impl Outcome {
    /// An outcome requesting a requeue
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
            deleted: false,
        }
    }

    /// An outcome recording that the claim is gone
    pub fn deleted() -> Self {
        Self {
            requeue_after: None,
            deleted: true,
        }
    }

    /// Keep the earlier of two requeue deadlines
    pub fn merge_requeue(&mut self, after: Duration) {
        self.requeue_after = Some(match self.requeue_after {
            Some(existing) => existing.min(after),
            None => after,
        });
    }
}
