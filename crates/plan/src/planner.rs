use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use keel_core::{
    BundleRegistry, ExecutionPlan, KindOrder, KubeObject, ObjectRef, PlannedObject, LAST_UPGRADE_ID_ANNOTATION_KEY,
    PRESERVE_RESOURCES_ANNOTATION_KEY,
};
use keel_kubehub::UpgradeContext;
use metrics::histogram;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::normalize::{diff_summary, normalize};
use crate::preserve::{merge_preserved_resources, wants_preserved_resources};

/// Whether a plan moves the cluster forward to a bundle or back to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// Objects this process already wrote are left alone, so a resumed
    /// attempt does not write them twice.
    Forward,
    /// Only objects this process wrote are reverted.
    Rollback,
}

impl PlanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanMode::Forward => "forward",
            PlanMode::Rollback => "rollback",
        }
    }
}

/// Three-way diff of `desired` against `live`.
///
/// Desired objects without a live counterpart are created; live objects
/// without a desired counterpart are deleted. Matched pairs are compared after
/// normalization; differing ones are updated only when "last written by this
/// process" agrees with the mode (see [`PlanMode`]).
pub fn generate_plan(
    desired: Vec<KubeObject>,
    live: Vec<KubeObject>,
    process_id: &str,
    kinds: &KindOrder,
    mode: PlanMode,
) -> Result<ExecutionPlan> {
    let mut live_by_ref: FxHashMap<ObjectRef, KubeObject> = FxHashMap::default();
    for obj in live {
        let r = obj.object_ref().context("live object without identity")?;
        live_by_ref.insert(r, obj);
    }

    let mut plan = ExecutionPlan::default();
    let mut seen = FxHashSet::default();
    let mut skipped = 0usize;
    for mut obj in desired {
        obj.strip_server_fields();
        let r = obj.object_ref().context("desired object without identity")?;
        if !seen.insert(r.clone()) {
            return Err(anyhow!("object {} is desired more than once", r));
        }
        // live objects are only listed for managed kinds
        if !kinds.is_managed(&r.gvk) {
            return Err(anyhow!("object {} is of kind {}, which is not managed", r, r.gvk));
        }
        let Some(live_obj) = live_by_ref.remove(&r) else {
            plan.creations.push(PlannedObject { obj_ref: r, object: obj });
            continue;
        };

        if mode == PlanMode::Forward && wants_preserved_resources(&live_obj) {
            let mut merged = obj.clone();
            match merge_preserved_resources(&mut merged, &live_obj) {
                Ok(()) => {
                    if let Some(v) = live_obj.annotation(PRESERVE_RESOURCES_ANNOTATION_KEY) {
                        merged.set_annotation(PRESERVE_RESOURCES_ANNOTATION_KEY, v);
                    }
                    obj = merged;
                }
                Err(e) => warn!(object = %r, error = %e, "could not preserve resources; using desired object as is"),
            }
        }

        let want = normalize(&obj);
        let have = normalize(&live_obj);
        if want == have {
            skipped += 1;
            continue;
        }

        let touched_by_us = live_obj.annotation(LAST_UPGRADE_ID_ANNOTATION_KEY) == Some(process_id);
        if touched_by_us != (mode == PlanMode::Rollback) {
            debug!(object = %r, touched_by_us, mode = mode.as_str(), "differs but left alone");
            skipped += 1;
            continue;
        }

        let d = diff_summary(&want.into_value(), &have.into_value());
        debug!(object = %r, adds = d.adds, updates = d.updates, removes = d.removes, "queued update");
        obj.set_resource_version(live_obj.resource_version());
        plan.updates.push(PlannedObject { obj_ref: r, object: obj });
    }

    plan.deletions = live_by_ref.into_keys().collect();

    plan.creations.sort_by(|a, b| (kinds.priority(&a.obj_ref.gvk), &a.obj_ref).cmp(&(kinds.priority(&b.obj_ref.gvk), &b.obj_ref)));
    plan.updates.sort_by(|a, b| (kinds.priority(&a.obj_ref.gvk), &a.obj_ref).cmp(&(kinds.priority(&b.obj_ref.gvk), &b.obj_ref)));
    plan.deletions.sort_by(|a, b| kinds.priority(&b.gvk).cmp(&kinds.priority(&a.gvk)).then_with(|| a.cmp(b)));

    plan.check_disjoint()?;
    debug!(skipped, "unchanged or not ours to change");
    Ok(plan)
}

/// List the live managed objects and plan `desired` against them.
///
/// In certificate-rotation-only runs both sides are cut down to the
/// certificate objects, so nothing else is created, updated or deleted. A
/// rollback's desired side is a full snapshot, hence the second filter.
pub async fn plan_against_cluster(
    ctx: &UpgradeContext,
    mut desired: Vec<KubeObject>,
    kinds: &KindOrder,
    registry: &BundleRegistry,
    mode: PlanMode,
) -> Result<ExecutionPlan> {
    let t0 = Instant::now();
    let mut live = ctx.list_managed(kinds).await.context("listing live objects")?;
    if ctx.config().cert_rotation_only {
        live.retain(|o| o.object_ref().map(|r| registry.is_cert_object(&r)).unwrap_or(false));
        let before = desired.len();
        desired.retain(|o| o.object_ref().map(|r| registry.is_cert_object(&r)).unwrap_or(false));
        if desired.len() < before {
            debug!(dropped = before - desired.len(), "left non-certificate objects out of the plan");
        }
    }
    let plan = generate_plan(desired, live, ctx.process_id(), kinds, mode)?;
    histogram!("upgrader_plan_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(mode = mode.as_str(), summary = %plan.summary(), took_ms = %t0.elapsed().as_millis(), "generated plan");
    Ok(plan)
}
