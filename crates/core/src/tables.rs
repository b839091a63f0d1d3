//! Process-wide constant tables. Built once at startup and handed to the
//! components that need them.

use crate::object::{Gvk, ObjectRef};

/// Managed kinds in dependency order: referents before referrers.
///
/// Creations and updates run in ascending order of [`KindOrder::priority`],
/// deletions in descending order. The list doubles as the set of kinds whose
/// live objects are listed when planning.
#[derive(Debug, Clone)]
pub struct KindOrder {
    kinds: Vec<Gvk>,
}

impl Default for KindOrder {
    fn default() -> Self {
        Self::new(vec![
            Gvk::new("", "v1", "ServiceAccount"),
            Gvk::new("", "v1", "Secret"),
            Gvk::new("", "v1", "ConfigMap"),
            Gvk::new("networking.k8s.io", "v1", "NetworkPolicy"),
            Gvk::new("security.openshift.io", "v1", "SecurityContextConstraints"),
            Gvk::new("rbac.authorization.k8s.io", "v1", "ClusterRole"),
            Gvk::new("rbac.authorization.k8s.io", "v1", "Role"),
            Gvk::new("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
            Gvk::new("rbac.authorization.k8s.io", "v1", "RoleBinding"),
            Gvk::new("apps", "v1", "DaemonSet"),
            Gvk::new("apps", "v1", "Deployment"),
            Gvk::new("", "v1", "Service"),
            Gvk::new("admissionregistration.k8s.io", "v1", "ValidatingWebhookConfiguration"),
        ])
    }
}

impl KindOrder {
    pub fn new(kinds: Vec<Gvk>) -> Self {
        Self { kinds }
    }

    pub fn kinds(&self) -> &[Gvk] {
        &self.kinds
    }

    /// Position of the kind in the order; kinds not in the table sort last.
    /// Versions are ignored.
    pub fn priority(&self, gvk: &Gvk) -> usize {
        self.kinds.iter().position(|k| k.same_kind(gvk)).unwrap_or(self.kinds.len())
    }

    pub fn is_managed(&self, gvk: &Gvk) -> bool {
        self.kinds.iter().any(|k| k.same_kind(gvk))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicKind {
    Secret,
    ConfigMap,
}

/// An object synthesized from raw bundle files rather than parsed from YAML.
#[derive(Debug, Clone)]
pub struct DynamicObjectDesc {
    pub kind: DynamicKind,
    pub name: String,
    /// Skip the object entirely when any source file is missing.
    pub optional: bool,
    pub files: Vec<String>,
}

impl DynamicObjectDesc {
    fn new(kind: DynamicKind, name: &str, optional: bool, files: &[&str]) -> Self {
        Self { kind, name: name.to_string(), optional, files: files.iter().map(|f| f.to_string()).collect() }
    }
}

/// Static description of bundle layout.
#[derive(Debug, Clone)]
pub struct BundleRegistry {
    pub dynamic_objects: Vec<DynamicObjectDesc>,
    /// Files that may be present without being consumed. Entries ending in `/`
    /// match every path below that directory.
    pub ignored_paths: Vec<String>,
    /// Secret that is handed out with bundles but never managed declaratively.
    pub additional_ca_secret: String,
    /// Names of the Secrets carrying certificates; the only objects kept in
    /// certificate-rotation-only runs.
    pub cert_secrets: Vec<String>,
}

impl Default for BundleRegistry {
    fn default() -> Self {
        use DynamicKind::*;
        Self {
            dynamic_objects: vec![
                DynamicObjectDesc::new(Secret, "sensor-tls", false, &["ca.pem", "sensor-cert.pem", "sensor-key.pem"]),
                DynamicObjectDesc::new(Secret, "collector-tls", false, &["ca.pem", "collector-cert.pem", "collector-key.pem"]),
                DynamicObjectDesc::new(
                    Secret,
                    "admission-control-tls",
                    true,
                    &["ca.pem", "admission-control-cert.pem", "admission-control-key.pem"],
                ),
                DynamicObjectDesc::new(ConfigMap, "sensor-bundle-info", true, &["cluster-name", "bundle-version"]),
            ],
            ignored_paths: [
                "NOTES.txt",
                "ca-setup-sensor.sh",
                "delete-ca-sensor.sh",
                "sensor.sh",
                "delete-sensor.sh",
                "docker-auth.sh",
                "additional-cas/",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            additional_ca_secret: "additional-ca-sensor".to_string(),
            cert_secrets: vec!["sensor-tls".into(), "collector-tls".into(), "admission-control-tls".into()],
        }
    }
}

impl BundleRegistry {
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignored_paths.iter().any(|p| if p.ends_with('/') { path.starts_with(p.as_str()) } else { path == p })
    }

    /// Whether `r` is one of the certificate-bearing Secrets.
    pub fn is_cert_object(&self, r: &ObjectRef) -> bool {
        r.gvk.group.is_empty() && r.gvk.kind == "Secret" && self.cert_secrets.iter().any(|n| n == &r.name)
    }

    pub fn is_additional_ca(&self, r: &ObjectRef) -> bool {
        r.gvk.group.is_empty() && r.gvk.kind == "Secret" && r.name == self.additional_ca_secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_follows_dependency_order() {
        let order = KindOrder::default();
        let sa = order.priority(&Gvk::new("", "v1", "ServiceAccount"));
        let role = order.priority(&Gvk::new("rbac.authorization.k8s.io", "v1", "Role"));
        let binding = order.priority(&Gvk::new("rbac.authorization.k8s.io", "v1", "RoleBinding"));
        let deploy = order.priority(&Gvk::new("apps", "v1", "Deployment"));
        let webhook = order.priority(&Gvk::new("admissionregistration.k8s.io", "v1", "ValidatingWebhookConfiguration"));
        assert!(sa < role && role < binding && binding < deploy && deploy < webhook);
    }

    #[test]
    fn unknown_kinds_sort_last_and_versions_are_ignored() {
        let order = KindOrder::default();
        assert_eq!(order.priority(&Gvk::new("example.com", "v1", "Widget")), order.kinds().len());
        assert_eq!(order.priority(&Gvk::new("apps", "v1beta2", "Deployment")), order.priority(&Gvk::new("apps", "v1", "Deployment")));
    }

    #[test]
    fn ignore_list_supports_directory_prefixes() {
        let reg = BundleRegistry::default();
        assert!(reg.is_ignored("NOTES.txt"));
        assert!(reg.is_ignored("additional-cas/corp.crt"));
        assert!(!reg.is_ignored("additional-cas"));
        assert!(!reg.is_ignored("sensor.yaml"));
    }

    #[test]
    fn cert_objects_are_secrets_by_name() {
        let reg = BundleRegistry::default();
        let secret = ObjectRef::new(Gvk::new("", "v1", "Secret"), Some("stackrox"), "sensor-tls");
        let cm = ObjectRef::new(Gvk::new("", "v1", "ConfigMap"), Some("stackrox"), "sensor-tls");
        assert!(reg.is_cert_object(&secret));
        assert!(!reg.is_cert_object(&cm));
    }
}
