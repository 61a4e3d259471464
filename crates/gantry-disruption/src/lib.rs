//! Voluntary disruption planning for Gantry
//!
//! Candidates are selected under the ordered policies drift → expiration →
//! emptiness → consolidation, their removal is simulated with the scheduler,
//! re-validated just before execution, and capped by per-pool budgets.

#![deny(missing_docs)]

pub mod candidate;
pub mod planner;
pub mod simulation;

pub use candidate::{Candidate, DisruptionMethod};
pub use planner::{DisruptionClient, KubeDisruptionClient, Planner, PLAN_INTERVAL};
pub use simulation::{simulate, Replacement, SimulationInputs};
