//! kube-rs backed [`ClusterAccess`].

use anyhow::{anyhow, Context};
use k8s_openapi::api::authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec};
use keel_core::{error::ClusterResult, ClusterError, Gvk, KubeObject, ObjectRef};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{AccessAttributes, AccessDecision, ClusterAccess, ServedResource};

/// Talks to the API server of the current kube context (in-cluster config when
/// running as a pod). Discovery runs once and is cached for the process.
pub struct KubeCluster {
    client: Client,
    discovery: OnceCell<Discovery>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: OnceCell::new() }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Ok(Self::new(client))
    }

    async fn discovery(&self) -> ClusterResult<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                debug!("running API discovery");
                Discovery::new(self.client.clone()).run().await.map_err(map_kube_err)
            })
            .await
    }

    async fn find_api_resource(&self, gvk: &Gvk) -> ClusterResult<(ApiResource, bool)> {
        let discovery = self.discovery().await?;
        let key = GroupVersionKind { group: gvk.group.clone(), version: gvk.version.clone(), kind: gvk.kind.clone() };
        discovery
            .resolve_gvk(&key)
            .map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced)))
            .ok_or_else(|| ClusterError::Unsupported(gvk.to_string()))
    }

    fn api(&self, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
        match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        }
    }

    async fn api_for(&self, gvk: &Gvk, namespace: Option<&str>) -> ClusterResult<(Api<DynamicObject>, ApiResource)> {
        let (ar, namespaced) = self.find_api_resource(gvk).await?;
        if namespaced && namespace.is_none() {
            return Err(ClusterError::Other(anyhow!("namespace required for namespaced kind {}", gvk)));
        }
        Ok((self.api(&ar, namespaced, namespace), ar))
    }
}

fn map_kube_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(resp.message),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => ClusterError::AlreadyExists(resp.message),
        kube::Error::Api(resp) => ClusterError::Api { code: resp.code, message: resp.message },
        other => ClusterError::Other(anyhow::Error::new(other)),
    }
}

/// List items come back without apiVersion/kind; restore them from the resource.
fn to_kube_object(mut obj: DynamicObject, ar: &ApiResource) -> ClusterResult<KubeObject> {
    obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    let v = serde_json::to_value(&obj).context("serializing DynamicObject")?;
    Ok(KubeObject::from_value(v)?)
}

fn to_dynamic(obj: &KubeObject) -> ClusterResult<DynamicObject> {
    Ok(serde_json::from_value(obj.clone().into_value()).context("converting object to DynamicObject")?)
}

#[async_trait::async_trait]
impl ClusterAccess for KubeCluster {
    async fn served_resources(&self) -> ClusterResult<Vec<ServedResource>> {
        let discovery = self.discovery().await?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    out.push(ServedResource {
                        group: ar.group.clone(),
                        version: ar.version.clone(),
                        kind: ar.kind.clone(),
                        plural: ar.plural.clone(),
                        namespaced: matches!(caps.scope, Scope::Namespaced),
                    });
                }
            }
        }
        // Stable-ish order
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        Ok(out)
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, label_selector: &str) -> ClusterResult<Vec<KubeObject>> {
        let (ar, namespaced) = self.find_api_resource(gvk).await?;
        let api = self.api(&ar, namespaced, namespace);
        let lp = ListParams::default().labels(label_selector);
        let list = api.list(&lp).await.map_err(map_kube_err)?;
        counter!("upgrader_kube_requests_total", 1u64, "verb" => "list");
        list.items.into_iter().map(|o| to_kube_object(o, &ar)).collect()
    }

    async fn get(&self, r: &ObjectRef) -> ClusterResult<Option<KubeObject>> {
        let (api, ar) = self.api_for(&r.gvk, r.namespace.as_deref()).await?;
        counter!("upgrader_kube_requests_total", 1u64, "verb" => "get");
        match api.get_opt(&r.name).await.map_err(map_kube_err)? {
            Some(o) => Ok(Some(to_kube_object(o, &ar)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &KubeObject) -> ClusterResult<KubeObject> {
        let r = obj.object_ref()?;
        let (api, ar) = self.api_for(&r.gvk, r.namespace.as_deref()).await?;
        counter!("upgrader_kube_requests_total", 1u64, "verb" => "create");
        let created = api.create(&PostParams::default(), &to_dynamic(obj)?).await.map_err(map_kube_err)?;
        to_kube_object(created, &ar)
    }

    async fn update(&self, obj: &KubeObject) -> ClusterResult<KubeObject> {
        let r = obj.object_ref()?;
        let (api, ar) = self.api_for(&r.gvk, r.namespace.as_deref()).await?;
        counter!("upgrader_kube_requests_total", 1u64, "verb" => "update");
        let replaced = api.replace(&r.name, &PostParams::default(), &to_dynamic(obj)?).await.map_err(map_kube_err)?;
        to_kube_object(replaced, &ar)
    }

    async fn delete(&self, r: &ObjectRef) -> ClusterResult<()> {
        let (api, _) = self.api_for(&r.gvk, r.namespace.as_deref()).await?;
        counter!("upgrader_kube_requests_total", 1u64, "verb" => "delete");
        api.delete(&r.name, &DeleteParams::background()).await.map_err(map_kube_err)?;
        Ok(())
    }

    async fn can_i(&self, attrs: &AccessAttributes) -> ClusterResult<AccessDecision> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let ra = ResourceAttributes {
            group: if attrs.group.is_empty() { None } else { Some(attrs.group.clone()) },
            version: Some(attrs.version.clone()),
            resource: Some(attrs.resource.clone()),
            verb: Some(attrs.verb.clone()),
            namespace: attrs.namespace.clone(),
            name: attrs.name.clone(),
            ..Default::default()
        };
        let ssar = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec { resource_attributes: Some(ra), ..Default::default() },
            ..Default::default()
        };
        counter!("upgrader_kube_requests_total", 1u64, "verb" => "access-review");
        let created = api.create(&PostParams::default(), &ssar).await.map_err(map_kube_err)?;
        let status = match created.status {
            Some(s) => s,
            None => return Ok(AccessDecision::Undecided("access review returned no status".into())),
        };
        let reason = status.reason.clone().unwrap_or_default();
        Ok(if status.allowed {
            AccessDecision::Allowed
        } else if status.denied.unwrap_or(false) {
            AccessDecision::Denied(reason)
        } else {
            AccessDecision::Undecided(status.evaluation_error.unwrap_or(reason))
        })
    }

    async fn openapi_schema(&self) -> ClusterResult<serde_json::Value> {
        let req = http::Request::get("/openapi/v2").body(Vec::new()).context("building OpenAPI request")?;
        counter!("upgrader_kube_requests_total", 1u64, "verb" => "openapi");
        self.client.request::<serde_json::Value>(req).await.map_err(map_kube_err)
    }
}
