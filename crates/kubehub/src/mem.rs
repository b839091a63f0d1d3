//! In-memory [`ClusterAccess`]: objects live in a map, access reviews follow
//! injectable rules. Used for dry tests and by the scenario suites.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use keel_core::{error::ClusterResult, ClusterError, Gvk, KubeObject, ObjectRef, Verb};

use crate::{find_resource, selector_matches, AccessAttributes, AccessDecision, ClusterAccess, ServedResource};

#[derive(Default)]
struct MemState {
    objects: BTreeMap<ObjectRef, KubeObject>,
    resources: Vec<ServedResource>,
    /// (verb, plural) pairs with a scripted decision.
    access_rules: BTreeMap<(String, String), AccessDecision>,
    /// Mutations that fail with a scripted API error.
    failures: BTreeMap<(Verb, ObjectRef), u16>,
    openapi: serde_json::Value,
    next_rv: u64,
    mutations: Vec<(Verb, ObjectRef)>,
}

pub struct MemCluster {
    state: Mutex<MemState>,
}

impl Default for MemCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCluster {
    /// Serves the built-in kinds the upgrader manages.
    pub fn new() -> Self {
        let ns = |g: &str, v: &str, k: &str, plural: &str| ServedResource::new(&Gvk::new(g, v, k), plural, true);
        let cluster = |g: &str, v: &str, k: &str, plural: &str| ServedResource::new(&Gvk::new(g, v, k), plural, false);
        let resources = vec![
            ns("", "v1", "ServiceAccount", "serviceaccounts"),
            ns("", "v1", "Secret", "secrets"),
            ns("", "v1", "ConfigMap", "configmaps"),
            ns("", "v1", "Service", "services"),
            ns("networking.k8s.io", "v1", "NetworkPolicy", "networkpolicies"),
            cluster("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles"),
            cluster("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings"),
            ns("rbac.authorization.k8s.io", "v1", "Role", "roles"),
            ns("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings"),
            ns("apps", "v1", "DaemonSet", "daemonsets"),
            ns("apps", "v1", "Deployment", "deployments"),
            cluster("admissionregistration.k8s.io", "v1", "ValidatingWebhookConfiguration", "validatingwebhookconfigurations"),
        ];
        Self { state: Mutex::new(MemState { resources, openapi: serde_json::json!({ "definitions": {} }), ..Default::default() }) }
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_resource(self, resource: ServedResource) -> Self {
        self.lock().resources.push(resource);
        self
    }

    pub fn with_openapi(self, doc: serde_json::Value) -> Self {
        self.lock().openapi = doc;
        self
    }

    /// Script the outcome of access reviews for `verb` on `plural`.
    pub fn set_access(&self, verb: &str, plural: &str, decision: AccessDecision) {
        self.lock().access_rules.insert((verb.to_string(), plural.to_string()), decision);
    }

    /// Make `verb` on `r` fail with an API error carrying `code`.
    pub fn fail_on(&self, verb: Verb, r: ObjectRef, code: u16) {
        self.lock().failures.insert((verb, r), code);
    }

    /// Seed an object as if it already existed (assigns uid and resourceVersion).
    pub fn seed(&self, obj: KubeObject) -> ClusterResult<()> {
        let r = obj.object_ref()?;
        let mut st = self.lock();
        let stored = Self::stamp(&mut st, obj, None);
        st.objects.insert(r, stored);
        Ok(())
    }

    pub fn objects(&self) -> Vec<KubeObject> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn object(&self, r: &ObjectRef) -> Option<KubeObject> {
        self.lock().objects.get(r).cloned()
    }

    /// Successful mutations in the order they happened.
    pub fn mutations(&self) -> Vec<(Verb, ObjectRef)> {
        self.lock().mutations.clone()
    }

    fn stamp(st: &mut MemState, mut obj: KubeObject, uid: Option<String>) -> KubeObject {
        st.next_rv += 1;
        let rv = st.next_rv.to_string();
        obj.set_resource_version(Some(&rv));
        let uid = uid.unwrap_or_else(|| format!("00000000-0000-0000-0000-{:012}", st.next_rv));
        obj.metadata_mut().insert("uid".into(), serde_json::Value::String(uid));
        obj
    }

    fn check_served(st: &MemState, gvk: &Gvk) -> ClusterResult<()> {
        find_resource(&st.resources, gvk).map(|_| ()).ok_or_else(|| ClusterError::Unsupported(gvk.to_string()))
    }

    fn check_failure(st: &MemState, verb: Verb, r: &ObjectRef) -> ClusterResult<()> {
        match st.failures.get(&(verb, r.clone())) {
            Some(code) => Err(ClusterError::api(*code, format!("scripted failure for {} {}", verb, r))),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterAccess for MemCluster {
    async fn served_resources(&self) -> ClusterResult<Vec<ServedResource>> {
        Ok(self.lock().resources.clone())
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, label_selector: &str) -> ClusterResult<Vec<KubeObject>> {
        let st = self.lock();
        Self::check_served(&st, gvk)?;
        Ok(st
            .objects
            .iter()
            .filter(|(r, _)| &r.gvk == gvk)
            .filter(|(r, _)| namespace.map(|ns| r.namespace.as_deref() == Some(ns)).unwrap_or(true))
            .filter(|(_, o)| selector_matches(label_selector, &o.labels()))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn get(&self, r: &ObjectRef) -> ClusterResult<Option<KubeObject>> {
        let st = self.lock();
        Self::check_served(&st, &r.gvk)?;
        Ok(st.objects.get(r).cloned())
    }

    async fn create(&self, obj: &KubeObject) -> ClusterResult<KubeObject> {
        let r = obj.object_ref()?;
        let mut st = self.lock();
        Self::check_served(&st, &r.gvk)?;
        Self::check_failure(&st, Verb::Create, &r)?;
        if st.objects.contains_key(&r) {
            return Err(ClusterError::AlreadyExists(r.to_string()));
        }
        if obj.resource_version().is_some() {
            return Err(ClusterError::api(400, "resourceVersion should not be set on objects to be created"));
        }
        let stored = Self::stamp(&mut st, obj.clone(), None);
        st.objects.insert(r.clone(), stored.clone());
        st.mutations.push((Verb::Create, r));
        Ok(stored)
    }

    async fn update(&self, obj: &KubeObject) -> ClusterResult<KubeObject> {
        let r = obj.object_ref()?;
        let mut st = self.lock();
        Self::check_served(&st, &r.gvk)?;
        Self::check_failure(&st, Verb::Update, &r)?;
        let existing = st.objects.get(&r).ok_or_else(|| ClusterError::NotFound(r.to_string()))?;
        if let Some(rv) = obj.resource_version() {
            if Some(rv) != existing.resource_version() {
                return Err(ClusterError::api(409, format!("conflict updating {}", r)));
            }
        }
        let uid = existing.get("metadata").and_then(|m| m.get("uid")).and_then(|u| u.as_str()).map(str::to_string);
        let stored = Self::stamp(&mut st, obj.clone(), uid);
        st.objects.insert(r.clone(), stored.clone());
        st.mutations.push((Verb::Update, r));
        Ok(stored)
    }

    async fn delete(&self, r: &ObjectRef) -> ClusterResult<()> {
        let mut st = self.lock();
        Self::check_served(&st, &r.gvk)?;
        Self::check_failure(&st, Verb::Delete, r)?;
        if st.objects.remove(r).is_none() {
            return Err(ClusterError::NotFound(r.to_string()));
        }
        st.mutations.push((Verb::Delete, r.clone()));
        Ok(())
    }

    async fn can_i(&self, attrs: &AccessAttributes) -> ClusterResult<AccessDecision> {
        let st = self.lock();
        Ok(st.access_rules.get(&(attrs.verb.clone(), attrs.resource.clone())).cloned().unwrap_or(AccessDecision::Allowed))
    }

    async fn openapi_schema(&self) -> ClusterResult<serde_json::Value> {
        Ok(self.lock().openapi.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> KubeObject {
        KubeObject::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "stackrox", "labels": { "app": name } }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_get_update_delete() {
        let c = MemCluster::new();
        let created = c.create(&cm("a")).await.unwrap();
        assert_eq!(created.resource_version(), Some("1"));
        let r = created.object_ref().unwrap();
        assert!(c.create(&cm("a")).await.unwrap_err().is_already_exists());

        let mut stale = created.clone();
        stale.set_resource_version(Some("0"));
        assert!(matches!(c.update(&stale).await, Err(ClusterError::Api { code: 409, .. })));

        let updated = c.update(&created).await.unwrap();
        assert_eq!(updated.resource_version(), Some("2"));
        assert_eq!(updated.get("metadata").unwrap()["uid"], created.get("metadata").unwrap()["uid"]);

        c.delete(&r).await.unwrap();
        assert!(c.get(&r).await.unwrap().is_none());
        assert!(c.delete(&r).await.unwrap_err().is_not_found());
        assert_eq!(c.mutations().len(), 3);
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_selector() {
        let c = MemCluster::new();
        c.seed(cm("a")).unwrap();
        c.seed(cm("b")).unwrap();
        let gvk = Gvk::new("", "v1", "ConfigMap");
        assert_eq!(c.list(&gvk, Some("stackrox"), "app=a").await.unwrap().len(), 1);
        assert_eq!(c.list(&gvk, None, "").await.unwrap().len(), 2);
        assert_eq!(c.list(&gvk, Some("other"), "").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unserved_kinds_are_unsupported() {
        let c = MemCluster::new();
        let gvk = Gvk::new("example.com", "v1", "Widget");
        assert!(matches!(c.list(&gvk, None, "").await, Err(ClusterError::Unsupported(_))));
    }

    #[tokio::test]
    async fn scripted_access_decisions() {
        let c = MemCluster::new();
        c.set_access("delete", "secrets", AccessDecision::Denied("nope".into()));
        let mut attrs = AccessAttributes {
            verb: "delete".into(),
            group: String::new(),
            version: "v1".into(),
            resource: "secrets".into(),
            namespace: Some("stackrox".into()),
            name: None,
        };
        assert_eq!(c.can_i(&attrs).await.unwrap(), AccessDecision::Denied("nope".into()));
        attrs.verb = "create".into();
        assert_eq!(c.can_i(&attrs).await.unwrap(), AccessDecision::Allowed);
    }
}
