use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    CleanupForeignState,
    SnapshotForRollForward,
    SnapshotForRollback,
    SnapshotForDryRun,
    FetchBundle,
    InstantiateBundle,
    GeneratePlan,
    GenerateRollbackPlan,
    Preflight,
    PreflightNoFail,
    Execute,
    CleanupOwner,
    WaitForDeletion,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::CleanupForeignState => "cleanup-foreign-state",
            Stage::SnapshotForRollForward => "snapshot-for-roll-forward",
            Stage::SnapshotForRollback => "snapshot-for-rollback",
            Stage::SnapshotForDryRun => "snapshot-for-dry-run",
            Stage::FetchBundle => "fetch-bundle",
            Stage::InstantiateBundle => "instantiate-bundle",
            Stage::GeneratePlan => "generate-plan",
            Stage::GenerateRollbackPlan => "generate-rollback-plan",
            Stage::Preflight => "preflight",
            Stage::PreflightNoFail => "preflight-no-fail",
            Stage::Execute => "execute",
            Stage::CleanupOwner => "cleanup-owner",
            Stage::WaitForDeletion => "wait-for-deletion",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

use Stage::*;

const ROLL_FORWARD: &[Stage] =
    &[CleanupForeignState, SnapshotForRollForward, FetchBundle, InstantiateBundle, GeneratePlan, Preflight, Execute];
const DRY_RUN: &[Stage] = &[SnapshotForDryRun, FetchBundle, InstantiateBundle, GeneratePlan, Preflight];
const VALIDATE_BUNDLE: &[Stage] = &[FetchBundle, InstantiateBundle];
const ROLLBACK: &[Stage] =
    &[SnapshotForRollback, GenerateRollbackPlan, PreflightNoFail, Execute, CleanupOwner, WaitForDeletion];
const CLEANUP: &[Stage] = &[CleanupForeignState, CleanupOwner, WaitForDeletion];

/// Names of all workflows, canonical spellings only.
pub const WORKFLOW_NAMES: &[&str] = &["roll-forward", "dry-run", "validate-bundle", "rollback", "cleanup"];

/// Stages of the named workflow, in execution order.
pub fn workflow_stages(name: &str) -> Option<&'static [Stage]> {
    match name {
        "roll-forward" => Some(ROLL_FORWARD),
        "dry-run" => Some(DRY_RUN),
        "validate-bundle" => Some(VALIDATE_BUNDLE),
        "rollback" | "roll-back" => Some(ROLLBACK),
        "cleanup" => Some(CLEANUP),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_workflow_resolves() {
        for name in WORKFLOW_NAMES {
            assert!(workflow_stages(name).is_some(), "{}", name);
        }
        assert_eq!(workflow_stages("roll-back"), workflow_stages("rollback"));
        assert!(workflow_stages("upgrade").is_none());
    }

    #[test]
    fn roll_forward_snapshots_before_it_executes() {
        let stages = workflow_stages("roll-forward").unwrap();
        let pos = |s: Stage| stages.iter().position(|x| *x == s).unwrap();
        assert!(pos(SnapshotForRollForward) < pos(GeneratePlan));
        assert!(pos(Preflight) < pos(Execute));
        assert_eq!(stages.last(), Some(&Execute));
    }

    #[test]
    fn stage_names_match_serde() {
        let json = serde_json::to_string(&SnapshotForDryRun).unwrap();
        assert_eq!(json, format!("\"{}\"", SnapshotForDryRun.name()));
    }
}
