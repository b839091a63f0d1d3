use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use keel_core::{ClusterError, Gvk, PROCESS_ID_LABEL_KEY, UPGRADE_RESOURCE_LABEL_KEY, UPGRADE_RESOURCE_LABEL_VALUE};
use keel_kubehub::UpgradeContext;
use tracing::{debug, info};

pub const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Delete upgrader state objects (snapshots and the like) left behind by other
/// upgrade processes. Returns how many were removed.
pub async fn cleanup_foreign_state(ctx: &UpgradeContext) -> Result<usize> {
    let selector = format!(
        "{}={},{}!={}",
        UPGRADE_RESOURCE_LABEL_KEY,
        UPGRADE_RESOURCE_LABEL_VALUE,
        PROCESS_ID_LABEL_KEY,
        ctx.process_id()
    );
    let ns = ctx.config().namespace.clone();
    let mut removed = 0;
    for gvk in [Gvk::new("", "v1", "Secret"), Gvk::new("", "v1", "ConfigMap")] {
        let stale = ctx.list(&gvk, Some(&ns), &selector).await.with_context(|| format!("listing stale {} objects", gvk.kind))?;
        for obj in stale {
            let r = obj.object_ref()?;
            match ctx.delete(&r).await {
                Ok(()) => {
                    info!(object = %r, owner = obj.label(PROCESS_ID_LABEL_KEY).unwrap_or("<none>"), "deleted state of another upgrade process");
                    removed += 1;
                }
                Err(e) if e.is_not_found() => debug!(object = %r, "already gone"),
                Err(e) => return Err(e).with_context(|| format!("deleting {}", r)),
            }
        }
    }
    Ok(removed)
}

/// Delete the upgrader's own workload, if one is configured.
pub async fn cleanup_owner(ctx: &UpgradeContext) -> Result<()> {
    let Some(owner) = ctx.config().owner.clone() else {
        debug!("no owner configured");
        return Ok(());
    };
    match ctx.delete(&owner).await {
        Ok(()) => {
            info!(owner = %owner, "deleted owner");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e).with_context(|| format!("deleting owner {}", owner)),
    }
}

/// Wait until the owner is gone. Cancellation ends the wait successfully: it
/// is what normally happens once the owner takes this process down with it.
pub async fn wait_for_deletion(ctx: &UpgradeContext, poll: Duration) -> Result<()> {
    let Some(owner) = ctx.config().owner.clone() else {
        return Ok(());
    };
    let limit = ctx.config().deletion_wait;
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        match ctx.get(&owner).await {
            Ok(None) => {
                info!(owner = %owner, "owner deleted");
                return Ok(());
            }
            Ok(Some(_)) => {}
            Err(ClusterError::Cancelled) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("checking for {}", owner)),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("{} still exists after {:?}", owner, limit));
        }
        tokio::select! {
            _ = ctx.cancel_token().cancelled() => {
                info!(owner = %owner, "cancelled while waiting for owner deletion");
                return Ok(());
            }
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
