//! Keel plan: the diff engine between desired objects and live cluster state.
//!
//! [`generate_plan`] is pure and works on object lists; [`plan_against_cluster`]
//! lists the live side first.

#![forbid(unsafe_code)]

pub mod normalize;
pub mod preserve;
mod planner;

pub use normalize::{diff_summary, normalize, DiffSummary};
pub use planner::{generate_plan, plan_against_cluster, PlanMode};
