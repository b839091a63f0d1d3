//! Structural normalization: bring desired and live objects to a comparable
//! form by dropping server-managed fields and filling in API-server defaults.
//! Idempotent.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use keel_core::{KubeObject, LAST_UPGRADE_ID_ANNOTATION_KEY};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

const SERVER_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

const VOLATILE_ANNOTATIONS: &[&str] = &[
    LAST_UPGRADE_ID_ANNOTATION_KEY,
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

const SERVICE_ALLOCATED: &[&str] = &["clusterIP", "clusterIPs", "ipFamilies", "ipFamilyPolicy", "internalTrafficPolicy"];

pub fn normalize(obj: &KubeObject) -> KubeObject {
    let mut out = obj.clone();
    normalize_in_place(&mut out);
    out
}

pub fn normalize_in_place(obj: &mut KubeObject) {
    prune_nulls(obj.as_map_mut());
    strip_common(obj);
    let group = obj.api_version().map(|av| av.split_once('/').map(|(g, _)| g).unwrap_or("")).unwrap_or("").to_string();
    let kind = obj.kind().unwrap_or("").to_string();
    match (group.as_str(), kind.as_str()) {
        ("", "Service") => normalize_service(obj),
        ("", "ServiceAccount") => normalize_service_account(obj),
        ("", "Secret") => normalize_secret(obj),
        ("apps", "Deployment") => {
            if let Some(spec) = obj.get_mut("spec").and_then(Json::as_object_mut) {
                default_deployment_spec(spec);
            }
        }
        ("apps", "DaemonSet") => {
            if let Some(spec) = obj.get_mut("spec").and_then(Json::as_object_mut) {
                default_daemonset_spec(spec);
            }
        }
        _ => {}
    }
}

/// Explicit nulls mean "unset" to the API server, which echoes some back
/// (e.g. `template.metadata.creationTimestamp`).
fn prune_nulls(map: &mut Map<String, Json>) {
    map.retain(|_, v| !v.is_null());
    for v in map.values_mut() {
        prune_nulls_in(v);
    }
}

fn prune_nulls_in(v: &mut Json) {
    match v {
        Json::Object(m) => prune_nulls(m),
        Json::Array(items) => items.iter_mut().for_each(prune_nulls_in),
        _ => {}
    }
}

fn strip_common(obj: &mut KubeObject) {
    obj.remove("status");
    let meta = obj.metadata_mut();
    for k in SERVER_METADATA {
        meta.remove(*k);
    }
    if let Some(annotations) = meta.get_mut("annotations").and_then(Json::as_object_mut) {
        for k in VOLATILE_ANNOTATIONS {
            annotations.remove(*k);
        }
    }
    for field in ["labels", "annotations"] {
        let empty = match meta.get(field) {
            Some(Json::Object(m)) => m.is_empty(),
            Some(Json::Null) => true,
            _ => false,
        };
        if empty {
            meta.remove(field);
        }
    }
}

fn normalize_service(obj: &mut KubeObject) {
    let Some(spec) = obj.get_mut("spec").and_then(Json::as_object_mut) else {
        return;
    };
    for k in SERVICE_ALLOCATED {
        spec.remove(*k);
    }
    set_default(spec, "type", json!("ClusterIP"));
    set_default(spec, "sessionAffinity", json!("None"));
    if let Some(ports) = spec.get_mut("ports").and_then(Json::as_array_mut) {
        for port in ports.iter_mut().filter_map(Json::as_object_mut) {
            set_default(port, "protocol", json!("TCP"));
            if let Some(p) = port.get("port").cloned() {
                set_default(port, "targetPort", p);
            }
        }
    }
}

/// Token and dockercfg secrets are attached by the control plane.
fn normalize_service_account(obj: &mut KubeObject) {
    let Some(name) = obj.name().map(str::to_string) else {
        return;
    };
    let generated = [format!("{}-token-", name), format!("{}-dockercfg-", name)];
    for field in ["secrets", "imagePullSecrets"] {
        let now_empty = match obj.get_mut(field).and_then(Json::as_array_mut) {
            Some(refs) => {
                refs.retain(|r| {
                    let n = r.get("name").and_then(Json::as_str).unwrap_or("");
                    !generated.iter().any(|prefix| n.starts_with(prefix.as_str()))
                });
                refs.is_empty()
            }
            None => obj.get(field).map(Json::is_null).unwrap_or(false),
        };
        if now_empty {
            obj.remove(field);
        }
    }
}

/// `stringData` is write-only: the server folds it into `data`.
fn normalize_secret(obj: &mut KubeObject) {
    if let Some(Json::Object(string_data)) = obj.remove("stringData") {
        let data = obj.as_map_mut().entry("data").or_insert_with(|| Json::Object(Map::new()));
        if !data.is_object() {
            *data = Json::Object(Map::new());
        }
        if let Json::Object(data) = data {
            for (k, v) in string_data {
                if let Some(s) = v.as_str() {
                    data.insert(k, Json::String(B64.encode(s)));
                }
            }
        }
    }
    if matches!(obj.get("data"), Some(Json::Object(m)) if m.is_empty()) || matches!(obj.get("data"), Some(Json::Null)) {
        obj.remove("data");
    }
    if obj.get("type").map(Json::is_null).unwrap_or(true) {
        obj.insert("type", json!("Opaque"));
    }
}

fn default_deployment_spec(spec: &mut Map<String, Json>) {
    set_default(spec, "replicas", json!(1));
    set_default(spec, "revisionHistoryLimit", json!(10));
    set_default(spec, "progressDeadlineSeconds", json!(600));
    set_default(
        spec,
        "strategy",
        json!({ "type": "RollingUpdate", "rollingUpdate": { "maxSurge": "25%", "maxUnavailable": "25%" } }),
    );
    default_pod_template(spec);
}

fn default_daemonset_spec(spec: &mut Map<String, Json>) {
    set_default(spec, "revisionHistoryLimit", json!(10));
    set_default(
        spec,
        "updateStrategy",
        json!({ "type": "RollingUpdate", "rollingUpdate": { "maxSurge": 0, "maxUnavailable": 1 } }),
    );
    default_pod_template(spec);
}

fn default_pod_template(spec: &mut Map<String, Json>) {
    let Some(pod) = spec.get_mut("template").and_then(|t| t.get_mut("spec")).and_then(Json::as_object_mut) else {
        return;
    };
    set_default(pod, "restartPolicy", json!("Always"));
    set_default(pod, "dnsPolicy", json!("ClusterFirst"));
    set_default(pod, "schedulerName", json!("default-scheduler"));
    set_default(pod, "terminationGracePeriodSeconds", json!(30));
    set_default(pod, "securityContext", json!({}));
    for field in ["initContainers", "containers"] {
        if let Some(containers) = pod.get_mut(field).and_then(Json::as_array_mut) {
            containers.iter_mut().filter_map(Json::as_object_mut).for_each(default_container);
        }
    }
}

fn default_container(c: &mut Map<String, Json>) {
    set_default(c, "terminationMessagePath", json!("/dev/termination-log"));
    set_default(c, "terminationMessagePolicy", json!("File"));
    let image = c.get("image").and_then(Json::as_str).unwrap_or("");
    let policy = if image_is_latest(image) { "Always" } else { "IfNotPresent" };
    set_default(c, "imagePullPolicy", json!(policy));
    if let Some(ports) = c.get_mut("ports").and_then(Json::as_array_mut) {
        for port in ports.iter_mut().filter_map(Json::as_object_mut) {
            set_default(port, "protocol", json!("TCP"));
        }
    }
}

fn image_is_latest(image: &str) -> bool {
    if image.contains('@') {
        return false;
    }
    let last = image.rsplit('/').next().unwrap_or(image);
    match last.split_once(':') {
        Some((_, tag)) => tag == "latest",
        None => true,
    }
}

fn set_default(m: &mut Map<String, Json>, key: &str, value: Json) {
    match m.get(key) {
        Some(v) if !v.is_null() => {}
        _ => {
            m.insert(key.to_string(), value);
        }
    }
}

/// Rough size of the difference between two documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) if av != bv => s.updates += 1,
            _ => {}
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
