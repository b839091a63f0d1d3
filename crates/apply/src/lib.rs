//! Keel apply: perform a plan's actions against the cluster.
//!
//! Actions run strictly in plan order. The first failure stops execution and
//! leaves the plan partially applied; undoing it is the job of a separate
//! rollback run.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{Context, Result};
use keel_core::{ExecutionPlan, KubeObject, Verb, LAST_UPGRADE_ID_ANNOTATION_KEY};
use keel_kubehub::UpgradeContext;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Shared objects whose creation found them already present.
    pub tolerated: usize,
}

/// Prepare a payload for submission: stamp the process id and drop the
/// resource version, so updates replace unconditionally.
pub fn stamp(obj: &KubeObject, process_id: &str) -> KubeObject {
    let mut out = obj.clone();
    out.set_annotation(LAST_UPGRADE_ID_ANNOTATION_KEY, process_id);
    out.set_resource_version(None);
    out
}

pub async fn execute_plan(ctx: &UpgradeContext, plan: &ExecutionPlan) -> Result<ExecutionSummary> {
    let t0 = Instant::now();
    let mut summary = ExecutionSummary::default();
    for action in plan.actions() {
        let r = action.obj_ref;
        ctx.resource_for(&r.gvk).await.with_context(|| format!("resolving resource for {}", r))?;
        let started = Instant::now();
        match (action.verb, action.object) {
            (Verb::Create, Some(obj)) => match ctx.create(&stamp(obj, ctx.process_id())).await {
                Ok(_) => summary.created += 1,
                Err(e) if e.is_already_exists() && ctx.config().is_shared(r) => {
                    warn!(object = %r, "shared object already exists; leaving it in place");
                    summary.tolerated += 1;
                }
                Err(e) => return Err(e).with_context(|| format!("creating {}", r)),
            },
            (Verb::Update, Some(obj)) => {
                ctx.update(&stamp(obj, ctx.process_id())).await.with_context(|| format!("updating {}", r))?;
                summary.updated += 1;
            }
            (Verb::Delete, _) => {
                ctx.delete(r).await.with_context(|| format!("deleting {}", r))?;
                summary.deleted += 1;
            }
            (verb, None) => return Err(anyhow::anyhow!("{} of {} has no payload", verb, r)),
        }
        counter!("upgrader_actions_total", 1u64, "verb" => action.verb.as_str());
        debug!(verb = %action.verb, object = %r, took_ms = %started.elapsed().as_millis(), "applied");
    }
    histogram!("upgrader_execute_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(
        created = summary.created,
        updated = summary.updated,
        deleted = summary.deleted,
        tolerated = summary.tolerated,
        took_ms = %t0.elapsed().as_millis(),
        "executed plan"
    );
    Ok(summary)
}
