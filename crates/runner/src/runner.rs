use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use keel_apply::execute_plan;
use keel_bundle::{instantiate, BundleContents, BundleSource, LocalBundleSource};
use keel_core::{BundleRegistry, ExecutionPlan, KindOrder, KubeObject};
use keel_kubehub::UpgradeContext;
use keel_plan::{plan_against_cluster, PlanMode};
use keel_preflight::run_preflight;
use keel_snapshot::take_or_read_snapshot;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::cleanup::{cleanup_foreign_state, cleanup_owner, wait_for_deletion, DELETION_POLL_INTERVAL};
use crate::workflow::{workflow_stages, Stage};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStatus {
    pub workflow: Option<String>,
    pub last_stage: Option<Stage>,
    pub last_error: Option<String>,
    pub finished: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("unknown workflow {0:?}")]
    UnknownWorkflow(String),

    #[error("workflow \"{workflow}\" failed at stage \"{stage}\": {source:#}")]
    Stage {
        workflow: String,
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl WorkflowError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            WorkflowError::Stage { stage, .. } => Some(*stage),
            WorkflowError::UnknownWorkflow(_) => None,
        }
    }
}

/// Data handed from one stage to the next within a single run.
#[derive(Default)]
struct RunState {
    snapshot: Option<Vec<KubeObject>>,
    bundle: Option<Box<dyn BundleContents>>,
    desired: Option<Vec<KubeObject>>,
    plan: Option<ExecutionPlan>,
}

fn take<T>(slot: &mut Option<T>, what: &str) -> Result<T> {
    slot.take().ok_or_else(|| anyhow!("no {} available from an earlier stage", what))
}

/// Runs named workflows against one upgrade context.
pub struct Runner {
    ctx: UpgradeContext,
    kinds: KindOrder,
    registry: BundleRegistry,
    source: Option<Arc<dyn BundleSource>>,
    status: watch::Sender<RunnerStatus>,
}

impl Runner {
    /// A runner with the default tables. A configured local bundle becomes the
    /// bundle source.
    pub fn new(ctx: UpgradeContext) -> Self {
        let source = ctx
            .config()
            .local_bundle
            .clone()
            .map(|p| Arc::new(LocalBundleSource::new(p)) as Arc<dyn BundleSource>);
        let (status, _) = watch::channel(RunnerStatus::default());
        Self { ctx, kinds: KindOrder::default(), registry: BundleRegistry::default(), source, status }
    }

    pub fn with_bundle_source(mut self, source: Arc<dyn BundleSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_kinds(mut self, kinds: KindOrder) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_registry(mut self, registry: BundleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn context(&self) -> &UpgradeContext {
        &self.ctx
    }

    pub fn subscribe(&self) -> watch::Receiver<RunnerStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> RunnerStatus {
        self.status.borrow().clone()
    }

    /// Run every stage of `workflow` in order, stopping at the first failure.
    pub async fn run(&self, workflow: &str) -> Result<(), WorkflowError> {
        let stages = workflow_stages(workflow).ok_or_else(|| WorkflowError::UnknownWorkflow(workflow.to_string()))?;
        let t0 = Instant::now();
        info!(workflow, process_id = %self.ctx.process_id(), stages = stages.len(), "starting workflow");
        self.status.send_replace(RunnerStatus { workflow: Some(workflow.to_string()), ..Default::default() });

        let mut state = RunState::default();
        for &stage in stages {
            let started = Instant::now();
            let res = self.run_stage(stage, &mut state).await;
            histogram!("upgrader_stage_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "stage" => stage.name());
            match res {
                Ok(()) => {
                    counter!("upgrader_stage_total", 1u64, "stage" => stage.name(), "outcome" => "ok");
                    info!(workflow, stage = %stage, took_ms = %started.elapsed().as_millis(), "stage done");
                    self.status.send_modify(|s| s.last_stage = Some(stage));
                }
                Err(source) => {
                    counter!("upgrader_stage_total", 1u64, "stage" => stage.name(), "outcome" => "error");
                    error!(workflow, stage = %stage, error = %format!("{:#}", source), "stage failed");
                    self.status.send_modify(|s| {
                        s.last_stage = Some(stage);
                        s.last_error = Some(format!("{:#}", source));
                    });
                    return Err(WorkflowError::Stage { workflow: workflow.to_string(), stage, source });
                }
            }
        }
        self.status.send_modify(|s| s.finished = true);
        info!(workflow, took_ms = %t0.elapsed().as_millis(), "workflow finished");
        Ok(())
    }

    async fn run_stage(&self, stage: Stage, state: &mut RunState) -> Result<()> {
        let ctx = &self.ctx;
        match stage {
            Stage::CleanupForeignState => {
                let removed = cleanup_foreign_state(ctx).await?;
                info!(removed, "cleaned up foreign state");
            }
            Stage::SnapshotForRollForward => {
                state.snapshot = Some(take_or_read_snapshot(ctx, &self.kinds, false, true).await?);
            }
            Stage::SnapshotForRollback => {
                state.snapshot = Some(take_or_read_snapshot(ctx, &self.kinds, true, false).await?);
            }
            Stage::SnapshotForDryRun => {
                state.snapshot = Some(take_or_read_snapshot(ctx, &self.kinds, false, false).await?);
            }
            Stage::FetchBundle => {
                let source = self.source.as_ref().ok_or_else(|| anyhow!("no bundle source configured"))?;
                state.bundle = Some(source.fetch().await.context("fetching bundle")?);
            }
            Stage::InstantiateBundle => {
                let bundle = take(&mut state.bundle, "bundle")?;
                let objects = instantiate(bundle.as_ref(), &self.registry, ctx.config())?;
                info!(objects = objects.len(), "instantiated bundle");
                state.desired = Some(objects);
            }
            Stage::GeneratePlan => {
                let desired = take(&mut state.desired, "desired objects")?;
                state.plan = Some(plan_against_cluster(ctx, desired, &self.kinds, &self.registry, PlanMode::Forward).await?);
            }
            Stage::GenerateRollbackPlan => {
                let snapshot = take(&mut state.snapshot, "snapshot")?;
                state.plan = Some(plan_against_cluster(ctx, snapshot, &self.kinds, &self.registry, PlanMode::Rollback).await?);
            }
            Stage::Preflight | Stage::PreflightNoFail => {
                let plan = state.plan.as_ref().ok_or_else(|| anyhow!("no plan available from an earlier stage"))?;
                let report = run_preflight(ctx, plan, stage == Stage::Preflight).await?;
                info!(errors = report.error_count(), warnings = report.warning_count(), plan = %plan.summary(), "preflight report");
            }
            Stage::Execute => {
                let plan = take(&mut state.plan, "plan")?;
                execute_plan(ctx, &plan).await?;
            }
            Stage::CleanupOwner => cleanup_owner(ctx).await?,
            Stage::WaitForDeletion => wait_for_deletion(ctx, DELETION_POLL_INTERVAL).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::UpgraderConfig;
    use keel_kubehub::MemCluster;
    use tokio_util::sync::CancellationToken;

    fn runner() -> Runner {
        let ctx = UpgradeContext::new(UpgraderConfig::new("p1", "stackrox"), Arc::new(MemCluster::new()), CancellationToken::new());
        Runner::new(ctx)
    }

    #[tokio::test]
    async fn unknown_workflows_are_rejected() {
        let err = runner().run("upgrade").await.unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownWorkflow(ref w) if w == "upgrade"));
        assert_eq!(err.stage(), None);
    }

    #[tokio::test]
    async fn missing_bundle_source_fails_the_fetch_stage() {
        let r = runner();
        let err = r.run("validate-bundle").await.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::FetchBundle));
        assert_eq!(
            err.to_string(),
            "workflow \"validate-bundle\" failed at stage \"fetch-bundle\": no bundle source configured"
        );
        let status = r.status();
        assert_eq!(status.last_stage, Some(Stage::FetchBundle));
        assert!(!status.finished);
    }

    #[tokio::test]
    async fn rollback_needs_a_snapshot_of_this_process() {
        let err = runner().run("roll-back").await.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::SnapshotForRollback));
    }
}
