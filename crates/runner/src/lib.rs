//! Keel runner: sequences the upgrade stages into named workflows.
//!
//! A workflow is a fixed list of [`Stage`]s. Stages run one at a time and
//! hand their results (snapshot, bundle, desired objects, plan) to the
//! stages after them. The first failing stage ends the run; retrying is up to
//! whoever invoked it.

#![forbid(unsafe_code)]

mod cleanup;
mod runner;
mod workflow;

pub use cleanup::{cleanup_foreign_state, cleanup_owner, wait_for_deletion, DELETION_POLL_INTERVAL};
pub use runner::{Runner, RunnerStatus, WorkflowError};
pub use workflow::{workflow_stages, Stage, WORKFLOW_NAMES};
