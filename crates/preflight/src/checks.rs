//! The individual preflight checks, in the order they run.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use keel_core::{ClusterError, ExecutionPlan, ObjectRef, Verb, COMPONENT_LABEL_KEY, COMPONENT_LABEL_VALUE};
use keel_kubehub::{AccessAttributes, AccessDecision, ServedResource, UpgradeContext};
use keel_schema::OpenApiValidator;
use tracing::debug;

use crate::{Check, Reporter};

async fn served(ctx: &UpgradeContext, r: &ObjectRef) -> Result<Option<ServedResource>> {
    match ctx.resource_for(&r.gvk).await {
        Ok(res) => Ok(Some(res)),
        Err(ClusterError::Unsupported(_)) => Ok(None),
        Err(e) => Err(e).context("discovering served resources"),
    }
}

/// Every kind must be served, with the scope the plan assumes.
pub struct ResourcesCheck;

#[async_trait::async_trait]
impl Check for ResourcesCheck {
    fn name(&self) -> &'static str {
        "resources"
    }

    async fn run(&self, ctx: &UpgradeContext, plan: &ExecutionPlan, reporter: &mut Reporter) -> Result<()> {
        for action in plan.actions() {
            let r = action.obj_ref;
            match served(ctx, r).await? {
                None => reporter.error(format!("{}: kind {} is not served by the cluster", r, r.gvk)),
                Some(res) if res.namespaced && !r.namespaced() => {
                    reporter.error(format!("{}: kind is namespaced but no namespace is set", r))
                }
                Some(res) if !res.namespaced && r.namespaced() => {
                    reporter.error(format!("{}: kind is cluster-scoped but a namespace is set", r))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Objects to write must validate against the cluster's OpenAPI schema.
pub struct SchemaCheck;

#[async_trait::async_trait]
impl Check for SchemaCheck {
    fn name(&self) -> &'static str {
        "schema"
    }

    async fn run(&self, ctx: &UpgradeContext, plan: &ExecutionPlan, reporter: &mut Reporter) -> Result<()> {
        if plan.objects().next().is_none() {
            return Ok(());
        }
        let doc = ctx.openapi_schema().await.context("fetching OpenAPI schema")?;
        let validator = match OpenApiValidator::from_openapi_v2(&doc) {
            Ok(v) => v,
            Err(e) => {
                reporter.error(format!("cannot use the cluster's OpenAPI schema: {}", e));
                return Ok(());
            }
        };
        for p in plan.objects() {
            match validator.validate(&p.object) {
                Ok(None) => reporter.warn(format!("{}: no schema available, not validated", p.obj_ref)),
                Ok(Some(issues)) => {
                    for issue in issues {
                        reporter.error(format!("{}: {}", p.obj_ref, issue));
                    }
                }
                Err(e) => reporter.error(format!("{}: schema validation failed: {}", p.obj_ref, e)),
            }
        }
        Ok(())
    }
}

/// Namespaced actions may only target allowed namespaces.
pub struct NamespaceCheck;

#[async_trait::async_trait]
impl Check for NamespaceCheck {
    fn name(&self) -> &'static str {
        "namespace"
    }

    async fn run(&self, ctx: &UpgradeContext, plan: &ExecutionPlan, reporter: &mut Reporter) -> Result<()> {
        for action in plan.actions() {
            if let Some(ns) = &action.obj_ref.namespace {
                if !ctx.config().namespace_allowed(ns) {
                    reporter.error(format!("{} {}: namespace {} is not allowed", action.verb, action.obj_ref, ns));
                }
            }
        }
        Ok(())
    }
}

/// Objects to write must carry the ownership label.
pub struct LabelsCheck;

#[async_trait::async_trait]
impl Check for LabelsCheck {
    fn name(&self) -> &'static str {
        "labels"
    }

    async fn run(&self, ctx: &UpgradeContext, plan: &ExecutionPlan, reporter: &mut Reporter) -> Result<()> {
        for p in plan.objects() {
            if ctx.config().is_label_exempt(&p.obj_ref) {
                continue;
            }
            if p.object.label(COMPONENT_LABEL_KEY) != Some(COMPONENT_LABEL_VALUE) {
                reporter.error(format!("{}: missing label {}={}", p.obj_ref, COMPONENT_LABEL_KEY, COMPONENT_LABEL_VALUE));
            }
        }
        Ok(())
    }
}

/// Creations need absent targets (shared objects excepted); updates and
/// deletions need present ones.
pub struct PreconditionsCheck;

#[async_trait::async_trait]
impl Check for PreconditionsCheck {
    fn name(&self) -> &'static str {
        "preconditions"
    }

    async fn run(&self, ctx: &UpgradeContext, plan: &ExecutionPlan, reporter: &mut Reporter) -> Result<()> {
        for action in plan.actions() {
            let r = action.obj_ref;
            if served(ctx, r).await?.is_none() {
                continue;
            }
            let exists = match ctx.get(r).await {
                Ok(found) => found.is_some(),
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e).with_context(|| format!("looking up {}", r)),
            };
            match action.verb {
                Verb::Create if exists && !ctx.config().is_shared(r) => reporter.error(format!("{}: to be created but already exists", r)),
                Verb::Create if exists => reporter.warn(format!("{}: shared object already exists", r)),
                Verb::Update | Verb::Delete if !exists => reporter.error(format!("{}: to be {}d but does not exist", r, action.verb)),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Every verb the plan needs, and the verb needed to undo it, must be allowed.
pub struct AccessCheck;

impl AccessCheck {
    fn attributes(verb: Verb, res: &ServedResource, r: &ObjectRef, named: bool) -> AccessAttributes {
        AccessAttributes {
            verb: verb.as_str().to_string(),
            group: res.group.clone(),
            version: res.version.clone(),
            resource: res.plural.clone(),
            namespace: r.namespace.clone(),
            name: named.then(|| r.name.clone()),
        }
    }
}

#[async_trait::async_trait]
impl Check for AccessCheck {
    fn name(&self) -> &'static str {
        "access"
    }

    async fn run(&self, ctx: &UpgradeContext, plan: &ExecutionPlan, reporter: &mut Reporter) -> Result<()> {
        let mut wanted = BTreeSet::new();
        for action in plan.actions() {
            let Some(res) = served(ctx, action.obj_ref).await? else {
                continue;
            };
            for verb in [action.verb, action.verb.inverse()] {
                // creations are reviewed without a name: the object does not exist yet
                wanted.insert(Self::attributes(verb, &res, action.obj_ref, verb != Verb::Create));
            }
        }
        debug!(reviews = wanted.len(), "checking access");
        for attrs in &wanted {
            match ctx.can_i(attrs).await.with_context(|| format!("reviewing access for {}", attrs))? {
                AccessDecision::Allowed => {}
                AccessDecision::Denied(reason) => reporter.error(format!("not allowed to {}: {}", attrs, reason)),
                AccessDecision::Undecided(reason) => {
                    reporter.error(format!("could not determine whether allowed to {}: {}", attrs, reason))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Gvk, KubeObject, PlannedObject, UpgraderConfig};
    use keel_kubehub::MemCluster;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn obj(v: serde_json::Value) -> PlannedObject {
        PlannedObject::new(KubeObject::from_value(v).unwrap()).unwrap()
    }

    fn labeled_cm(name: &str, ns: &str) -> PlannedObject {
        obj(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": ns, "labels": { COMPONENT_LABEL_KEY: COMPONENT_LABEL_VALUE } }
        }))
    }

    fn ctx(cluster: Arc<MemCluster>) -> UpgradeContext {
        UpgradeContext::new(UpgraderConfig::new("p1", "stackrox"), cluster, CancellationToken::new())
    }

    async fn run(check: &dyn Check, ctx: &UpgradeContext, plan: &ExecutionPlan) -> Reporter {
        let mut reporter = Reporter::default();
        check.run(ctx, plan, &mut reporter).await.unwrap();
        reporter
    }

    #[tokio::test]
    async fn resources_check_flags_unserved_kinds_and_scope_mismatch() {
        let c = ctx(Arc::new(MemCluster::new()));
        let plan = ExecutionPlan {
            creations: vec![
                obj(json!({ "apiVersion": "security.openshift.io/v1", "kind": "SecurityContextConstraints", "metadata": { "name": "scc" } })),
                obj(json!({ "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": { "name": "r", "namespace": "stackrox" } })),
                labeled_cm("ok", "stackrox"),
            ],
            ..Default::default()
        };
        let r = run(&ResourcesCheck, &c, &plan).await;
        assert_eq!(r.errors().len(), 2, "{:?}", r.errors());
        assert!(r.errors()[0].contains("not served"));
        assert!(r.errors()[1].contains("cluster-scoped"));
    }

    #[tokio::test]
    async fn namespace_and_label_checks() {
        let c = ctx(Arc::new(MemCluster::new()));
        let unlabeled = obj(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "u", "namespace": "stackrox" } }));
        let pull = obj(json!({ "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "stackrox", "namespace": "stackrox" } }));
        let plan = ExecutionPlan {
            creations: vec![labeled_cm("a", "kube-system"), unlabeled, pull],
            deletions: vec![ObjectRef::new(Gvk::new("", "v1", "ConfigMap"), Some("default"), "x")],
            ..Default::default()
        };
        let ns = run(&NamespaceCheck, &c, &plan).await;
        assert_eq!(ns.errors().len(), 2);
        let labels = run(&LabelsCheck, &c, &plan).await;
        assert_eq!(labels.errors().len(), 1);
        assert!(labels.errors()[0].contains("stackrox/u"));
    }

    #[tokio::test]
    async fn preconditions_follow_existence() {
        let cluster = Arc::new(MemCluster::new());
        cluster.seed(labeled_cm("exists", "stackrox").object).unwrap();
        cluster
            .seed(KubeObject::from_value(json!({ "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "stackrox", "namespace": "stackrox" } })).unwrap())
            .unwrap();
        let c = ctx(cluster);
        let pull = obj(json!({ "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "stackrox", "namespace": "stackrox" } }));
        let plan = ExecutionPlan {
            creations: vec![labeled_cm("exists", "stackrox"), pull],
            updates: vec![labeled_cm("missing", "stackrox")],
            deletions: vec![ObjectRef::new(Gvk::new("", "v1", "ConfigMap"), Some("stackrox"), "exists")],
        };
        let r = run(&PreconditionsCheck, &c, &plan).await;
        assert_eq!(r.errors().len(), 2, "{:?}", r.errors());
        assert_eq!(r.warnings().len(), 1);
    }

    #[tokio::test]
    async fn access_check_reviews_inverse_verbs() {
        let cluster = Arc::new(MemCluster::new());
        cluster.set_access("delete", "configmaps", AccessDecision::Denied("rbac".into()));
        cluster.set_access("update", "serviceaccounts", AccessDecision::Undecided("webhook error".into()));
        let c = ctx(cluster);
        let sa = obj(json!({ "apiVersion": "v1", "kind": "ServiceAccount", "metadata": { "name": "s", "namespace": "stackrox" } }));
        let plan = ExecutionPlan { creations: vec![labeled_cm("a", "stackrox")], updates: vec![sa], ..Default::default() };
        let r = run(&AccessCheck, &c, &plan).await;
        assert_eq!(r.errors().len(), 2, "{:?}", r.errors());
        assert!(r.errors().iter().any(|e| e.contains("not allowed to delete configmaps/a in namespace stackrox")));
        assert!(r.errors().iter().any(|e| e.contains("could not determine")));
    }

    #[tokio::test]
    async fn schema_check_warns_without_definitions() {
        let c = ctx(Arc::new(MemCluster::new()));
        let plan = ExecutionPlan { creations: vec![labeled_cm("a", "stackrox")], ..Default::default() };
        let r = run(&SchemaCheck, &c, &plan).await;
        assert!(r.errors().is_empty());
        assert_eq!(r.warnings().len(), 1);
    }
}
