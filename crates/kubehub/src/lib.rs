//! Keel kubehub: the cluster-resource access capability consumed by every stage.
//!
//! [`ClusterAccess`] is the seam; [`KubeCluster`] talks to a real API server via
//! kube-rs and [`MemCluster`] keeps everything in memory (dry tests, demos).
//! Stages never call it directly but go through [`UpgradeContext`], which adds
//! cancellation and per-call timeouts.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::{error::ClusterResult, Gvk, KubeObject, ObjectRef};
use serde::{Deserialize, Serialize};

mod context;
mod kube_cluster;
mod mem;

pub use context::UpgradeContext;
pub use kube_cluster::KubeCluster;
pub use mem::MemCluster;

/// A resource kind served by the API server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServedResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name used in URLs and access reviews.
    pub plural: String,
    pub namespaced: bool,
}

impl ServedResource {
    pub fn new(gvk: &Gvk, plural: &str, namespaced: bool) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    pub fn gvk(&self) -> Gvk {
        Gvk::new(&self.group, &self.version, &self.kind)
    }

    pub fn matches(&self, gvk: &Gvk) -> bool {
        self.group == gvk.group && self.version == gvk.version && self.kind == gvk.kind
    }
}

/// Look up the served resource for an exact GVK.
pub fn find_resource<'a>(resources: &'a [ServedResource], gvk: &Gvk) -> Option<&'a ServedResource> {
    resources.iter().find(|r| r.matches(gvk))
}

/// Attributes of one "can I" question.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccessAttributes {
    pub verb: String,
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl std::fmt::Display for AccessAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.verb, self.resource)?;
        if !self.group.is_empty() {
            write!(f, ".{}", self.group)?;
        }
        if let Some(name) = &self.name {
            write!(f, "/{}", name)?;
        }
        if let Some(ns) = &self.namespace {
            write!(f, " in namespace {}", ns)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied(String),
    /// Neither allowed nor denied (no opinion, or an evaluation error).
    Undecided(String),
}

/// Cluster resource access. Implementations must be safe to share across tasks.
#[async_trait::async_trait]
pub trait ClusterAccess: Send + Sync {
    /// Kinds (and versions) served by the API server.
    async fn served_resources(&self) -> ClusterResult<Vec<ServedResource>>;

    /// List objects of one kind. `namespace` None lists across all namespaces
    /// (or the cluster scope). `label_selector` uses the `k=v,k!=v` syntax.
    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, label_selector: &str) -> ClusterResult<Vec<KubeObject>>;

    async fn get(&self, r: &ObjectRef) -> ClusterResult<Option<KubeObject>>;

    async fn create(&self, obj: &KubeObject) -> ClusterResult<KubeObject>;

    /// Replace an existing object.
    async fn update(&self, obj: &KubeObject) -> ClusterResult<KubeObject>;

    async fn delete(&self, r: &ObjectRef) -> ClusterResult<()>;

    async fn can_i(&self, attrs: &AccessAttributes) -> ClusterResult<AccessDecision>;

    /// The server's OpenAPI (v2) document.
    async fn openapi_schema(&self) -> ClusterResult<serde_json::Value>;
}

/// Evaluate an equality-based label selector (`k=v`, `k==v`, `k!=v`, `k`, `!k`)
/// against a label set. An empty selector matches everything.
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').map(str::trim).filter(|s| !s.is_empty()).all(|req| {
        if let Some((k, v)) = req.split_once("!=") {
            labels.get(k.trim()).map(|x| x != v.trim()).unwrap_or(true)
        } else if let Some((k, v)) = req.split_once("==").or_else(|| req.split_once('=')) {
            labels.get(k.trim()).map(|x| x == v.trim()).unwrap_or(false)
        } else if let Some(k) = req.strip_prefix('!') {
            !labels.contains_key(k.trim())
        } else {
            labels.contains_key(req)
        }
    })
}
