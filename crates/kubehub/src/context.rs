use std::future::Future;
use std::sync::Arc;

use keel_core::{component_selector, error::ClusterResult, ClusterError, Gvk, KindOrder, KubeObject, ObjectRef, UpgraderConfig};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{find_resource, AccessAttributes, AccessDecision, ClusterAccess, ServedResource};

/// Everything a stage needs to talk to the cluster on behalf of one upgrade
/// attempt. Cheap to clone; clones share the cancellation token and the
/// discovery cache.
#[derive(Clone)]
pub struct UpgradeContext {
    config: Arc<UpgraderConfig>,
    cluster: Arc<dyn ClusterAccess>,
    cancel: CancellationToken,
    resources: Arc<OnceCell<Vec<ServedResource>>>,
}

impl UpgradeContext {
    pub fn new(config: UpgraderConfig, cluster: Arc<dyn ClusterAccess>, cancel: CancellationToken) -> Self {
        Self { config: Arc::new(config), cluster, cancel, resources: Arc::new(OnceCell::new()) }
    }

    pub fn config(&self) -> &UpgraderConfig {
        &self.config
    }

    pub fn process_id(&self) -> &str {
        &self.config.process_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one cluster call, bounded by the request timeout and aborted promptly
    /// when the context is cancelled.
    pub async fn call<T, F>(&self, fut: F) -> ClusterResult<T>
    where
        F: Future<Output = ClusterResult<T>>,
    {
        let timeout = self.config.request_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClusterError::Cancelled),
            res = tokio::time::timeout(timeout, fut) => res.unwrap_or(Err(ClusterError::Timeout(timeout))),
        }
    }

    /// Served resources, discovered once per context.
    pub async fn served_resources(&self) -> ClusterResult<&[ServedResource]> {
        let cluster = self.cluster.clone();
        let res = self.resources.get_or_try_init(|| self.call(async move { cluster.served_resources().await })).await?;
        Ok(res.as_slice())
    }

    pub async fn resource_for(&self, gvk: &Gvk) -> ClusterResult<ServedResource> {
        let resources = self.served_resources().await?;
        find_resource(resources, gvk).cloned().ok_or_else(|| ClusterError::Unsupported(gvk.to_string()))
    }

    pub async fn get(&self, r: &ObjectRef) -> ClusterResult<Option<KubeObject>> {
        self.call(self.cluster.get(r)).await
    }

    pub async fn list(&self, gvk: &Gvk, namespace: Option<&str>, label_selector: &str) -> ClusterResult<Vec<KubeObject>> {
        self.call(self.cluster.list(gvk, namespace, label_selector)).await
    }

    pub async fn create(&self, obj: &KubeObject) -> ClusterResult<KubeObject> {
        self.call(self.cluster.create(obj)).await
    }

    pub async fn update(&self, obj: &KubeObject) -> ClusterResult<KubeObject> {
        self.call(self.cluster.update(obj)).await
    }

    pub async fn delete(&self, r: &ObjectRef) -> ClusterResult<()> {
        self.call(self.cluster.delete(r)).await
    }

    pub async fn can_i(&self, attrs: &AccessAttributes) -> ClusterResult<AccessDecision> {
        self.call(self.cluster.can_i(attrs)).await
    }

    pub async fn openapi_schema(&self) -> ClusterResult<serde_json::Value> {
        self.call(self.cluster.openapi_schema()).await
    }

    /// All live objects carrying the ownership label, across the managed kinds
    /// the server serves. Namespaced kinds are listed per allowed namespace.
    pub async fn list_managed(&self, kinds: &KindOrder) -> ClusterResult<Vec<KubeObject>> {
        let selector = component_selector();
        let mut out = Vec::new();
        for gvk in kinds.kinds() {
            let res = match find_resource(self.served_resources().await?, gvk) {
                Some(r) => r.clone(),
                None => {
                    debug!(gvk = %gvk, "kind not served; skipping");
                    continue;
                }
            };
            if res.namespaced {
                for ns in &self.config.allowed_namespaces {
                    out.extend(self.list(gvk, Some(ns), &selector).await?);
                }
            } else {
                out.extend(self.list(gvk, None, &selector).await?);
            }
        }
        debug!(count = out.len(), "listed managed objects");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemCluster;
    use std::time::Duration;

    struct Stuck;

    #[async_trait::async_trait]
    impl ClusterAccess for Stuck {
        async fn served_resources(&self) -> ClusterResult<Vec<ServedResource>> {
            std::future::pending().await
        }
        async fn list(&self, _: &Gvk, _: Option<&str>, _: &str) -> ClusterResult<Vec<KubeObject>> {
            std::future::pending().await
        }
        async fn get(&self, _: &ObjectRef) -> ClusterResult<Option<KubeObject>> {
            std::future::pending().await
        }
        async fn create(&self, _: &KubeObject) -> ClusterResult<KubeObject> {
            std::future::pending().await
        }
        async fn update(&self, _: &KubeObject) -> ClusterResult<KubeObject> {
            std::future::pending().await
        }
        async fn delete(&self, _: &ObjectRef) -> ClusterResult<()> {
            std::future::pending().await
        }
        async fn can_i(&self, _: &AccessAttributes) -> ClusterResult<AccessDecision> {
            std::future::pending().await
        }
        async fn openapi_schema(&self) -> ClusterResult<serde_json::Value> {
            std::future::pending().await
        }
    }

    fn secret_ref() -> ObjectRef {
        ObjectRef::new(Gvk::new("", "v1", "Secret"), Some("stackrox"), "x")
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_calls() {
        let cancel = CancellationToken::new();
        let ctx = UpgradeContext::new(UpgraderConfig::new("p", "stackrox"), Arc::new(Stuck), cancel.clone());
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = ctx.get(&secret_ref()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Cancelled));
        trigger.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn calls_time_out() {
        let mut cfg = UpgraderConfig::new("p", "stackrox");
        cfg.request_timeout = Duration::from_secs(1);
        let ctx = UpgradeContext::new(cfg, Arc::new(Stuck), CancellationToken::new());
        let err = ctx.get(&secret_ref()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout(_)));
    }

    #[tokio::test]
    async fn list_managed_only_returns_labeled_objects_in_allowed_namespaces() {
        let cluster = Arc::new(MemCluster::new());
        let mk = |name: &str, ns: &str, labeled: bool| {
            let mut o = KubeObject::from_value(serde_json::json!({
                "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "namespace": ns }
            }))
            .unwrap();
            if labeled {
                o.set_label(keel_core::COMPONENT_LABEL_KEY, keel_core::COMPONENT_LABEL_VALUE);
            }
            o
        };
        cluster.seed(mk("a", "stackrox", true)).unwrap();
        cluster.seed(mk("b", "stackrox", false)).unwrap();
        cluster.seed(mk("c", "elsewhere", true)).unwrap();
        let ctx = UpgradeContext::new(UpgraderConfig::new("p", "stackrox"), cluster, CancellationToken::new());
        let live = ctx.list_managed(&KindOrder::default()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name(), Some("a"));
    }
}
