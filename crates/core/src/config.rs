//! Upgrader configuration: plain data, built once per process.

use std::path::PathBuf;
use std::time::Duration;

use crate::object::{Gvk, ObjectRef};

pub const DEFAULT_NAMESPACE: &str = "stackrox";

#[derive(Debug, Clone)]
pub struct UpgraderConfig {
    /// Identifies one upgrade attempt end-to-end, across process restarts.
    pub process_id: String,
    pub cluster_id: String,
    /// Namespace the agent (and the upgrader's state) lives in.
    pub namespace: String,
    /// Namespaces namespaced actions may target.
    pub allowed_namespaces: Vec<String>,
    pub cert_rotation_only: bool,
    /// The upgrader's own workload, removed once an upgrade completes.
    pub owner: Option<ObjectRef>,
    /// Objects shared with other components: creating them may conflict.
    pub shared_objects: Vec<ObjectRef>,
    /// Objects that need not carry the ownership label.
    pub label_exempt: Vec<ObjectRef>,
    pub request_timeout: Duration,
    /// Upper bound for the wait-for-deletion stage.
    pub deletion_wait: Duration,
    /// Directory or `.tar.gz` bundle to use instead of fetching one.
    pub local_bundle: Option<PathBuf>,
}

impl UpgraderConfig {
    pub fn new(process_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let shared: Vec<ObjectRef> = ["stackrox", "collector-stackrox"]
            .iter()
            .map(|n| ObjectRef::new(Gvk::new("", "v1", "Secret"), Some(&namespace), n))
            .collect();
        Self {
            process_id: process_id.into(),
            cluster_id: String::new(),
            allowed_namespaces: vec![namespace.clone()],
            namespace,
            cert_rotation_only: false,
            owner: None,
            label_exempt: shared.clone(),
            shared_objects: shared,
            request_timeout: Duration::from_secs(30),
            deletion_wait: Duration::from_secs(300),
            local_bundle: None,
        }
    }

    pub fn is_shared(&self, r: &ObjectRef) -> bool {
        self.shared_objects.iter().any(|s| s == r)
    }

    pub fn is_label_exempt(&self, r: &ObjectRef) -> bool {
        self.label_exempt.iter().any(|s| s == r)
    }

    pub fn namespace_allowed(&self, ns: &str) -> bool {
        self.allowed_namespaces.iter().any(|a| a == ns)
    }

    /// Reference to the upgrader's own Deployment by name, in the agent namespace.
    pub fn owner_deployment(&self, name: &str) -> ObjectRef {
        ObjectRef::new(Gvk::new("apps", "v1", "Deployment"), Some(&self.namespace), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_scope_everything_to_the_agent_namespace() {
        let cfg = UpgraderConfig::new("p1", "stackrox");
        assert!(cfg.namespace_allowed("stackrox"));
        assert!(!cfg.namespace_allowed("kube-system"));
        let pull = ObjectRef::new(Gvk::new("", "v1", "Secret"), Some("stackrox"), "stackrox");
        assert!(cfg.is_shared(&pull));
        assert!(cfg.is_label_exempt(&pull));
        assert_eq!(cfg.owner_deployment("sensor-upgrader").to_string(), "apps/v1/Deployment stackrox/sensor-upgrader");
    }
}
