//! Keel schema: validate objects against the OpenAPI (v2) definitions served
//! by the cluster, before anything is submitted.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use jsonschema::{Draft, JSONSchema};
use keel_core::{Gvk, KubeObject};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::debug;

const GVK_EXTENSION: &str = "x-kubernetes-group-version-kind";
const QUANTITY_DEFINITION: &str = "io.k8s.apimachinery.pkg.api.resource.Quantity";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// JSON pointer into the object; empty for the root.
    pub path: String,
    pub error: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.error)
        } else {
            write!(f, "{}: {}", self.path, self.error)
        }
    }
}

/// Validator over one OpenAPI document. Compiled schemas are cached per
/// definition.
pub struct OpenApiValidator {
    definitions: Arc<Json>,
    by_gvk: HashMap<Gvk, String>,
    compiled: Mutex<HashMap<String, Arc<JSONSchema>>>,
}

impl OpenApiValidator {
    /// Index the `definitions` of an OpenAPI v2 document by the GVKs they
    /// declare.
    pub fn from_openapi_v2(doc: &Json) -> Result<Self> {
        let defs = doc
            .get("definitions")
            .and_then(Json::as_object)
            .ok_or_else(|| anyhow!("OpenAPI document has no definitions"))?;
        let mut definitions = Map::with_capacity(defs.len());
        let mut by_gvk = HashMap::new();
        for (name, def) in defs {
            for gvk in declared_gvks(def) {
                by_gvk.entry(gvk).or_insert_with(|| name.clone());
            }
            let mut def = def.clone();
            relax(&mut def);
            if name == QUANTITY_DEFINITION {
                if let Some(m) = def.as_object_mut() {
                    m.remove("type");
                }
            }
            definitions.insert(name.clone(), def);
        }
        debug!(definitions = definitions.len(), kinds = by_gvk.len(), "indexed OpenAPI definitions");
        Ok(Self { definitions: Arc::new(Json::Object(definitions)), by_gvk, compiled: Mutex::new(HashMap::new()) })
    }

    pub fn knows(&self, gvk: &Gvk) -> bool {
        self.by_gvk.contains_key(gvk)
    }

    /// Validate one object. `Ok(None)` when the document has no definition for
    /// the object's kind; `Ok(Some(issues))` otherwise, empty when valid.
    pub fn validate(&self, obj: &KubeObject) -> Result<Option<Vec<ValidationIssue>>> {
        let gvk = obj.gvk()?;
        let Some(def) = self.by_gvk.get(&gvk) else {
            return Ok(None);
        };
        let schema = self.compiled_for(def)?;
        let mut instance = obj.clone().into_value();
        prune_nulls(&mut instance);
        let issues = match schema.validate(&instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.map(|e| ValidationIssue { path: e.instance_path.to_string(), error: e.to_string() }).collect(),
        };
        Ok(Some(issues))
    }

    fn compiled_for(&self, def: &str) -> Result<Arc<JSONSchema>> {
        let mut cache = self.compiled.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(s) = cache.get(def) {
            return Ok(s.clone());
        }
        let root = json!({
            "$ref": format!("#/definitions/{}", def),
            "definitions": self.definitions.as_ref(),
        });
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft4)
            .compile(&root)
            .map_err(|e| anyhow!("compiling schema for {}: {}", def, e))?;
        let compiled = Arc::new(compiled);
        cache.insert(def.to_string(), compiled.clone());
        Ok(compiled)
    }
}

fn declared_gvks(def: &Json) -> Vec<Gvk> {
    def.get(GVK_EXTENSION)
        .and_then(Json::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|g| {
                    let kind = g.get("kind")?.as_str()?;
                    let version = g.get("version")?.as_str()?;
                    let group = g.get("group").and_then(Json::as_str).unwrap_or("");
                    Some(Gvk::new(group, version, kind))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// `int-or-string` fields accept both JSON types; their declared `type` is
/// dropped.
fn relax(node: &mut Json) {
    match node {
        Json::Object(m) => {
            if m.get("format").and_then(Json::as_str) == Some("int-or-string") {
                m.remove("type");
            }
            for v in m.values_mut() {
                relax(v);
            }
        }
        Json::Array(items) => items.iter_mut().for_each(relax),
        _ => {}
    }
}

/// Explicit nulls mean "unset" to the API server.
fn prune_nulls(node: &mut Json) {
    match node {
        Json::Object(m) => {
            m.retain(|_, v| !v.is_null());
            m.values_mut().for_each(prune_nulls);
        }
        Json::Array(items) => items.iter_mut().for_each(prune_nulls),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openapi() -> Json {
        json!({
            "swagger": "2.0",
            "definitions": {
                "io.k8s.api.apps.v1.Deployment": {
                    "type": "object",
                    "properties": {
                        "apiVersion": { "type": "string" },
                        "kind": { "type": "string" },
                        "metadata": { "$ref": "#/definitions/io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta" },
                        "spec": { "$ref": "#/definitions/io.k8s.api.apps.v1.DeploymentSpec" }
                    },
                    "x-kubernetes-group-version-kind": [{ "group": "apps", "kind": "Deployment", "version": "v1" }]
                },
                "io.k8s.api.apps.v1.DeploymentSpec": {
                    "type": "object",
                    "properties": {
                        "replicas": { "type": "integer", "format": "int32" },
                        "template": { "$ref": "#/definitions/io.k8s.api.core.v1.PodTemplateSpec" }
                    }
                },
                "io.k8s.api.core.v1.PodTemplateSpec": {
                    "type": "object",
                    "properties": {
                        "spec": {
                            "type": "object",
                            "properties": {
                                "containers": { "type": "array", "items": { "$ref": "#/definitions/io.k8s.api.core.v1.Container" } }
                            }
                        }
                    }
                },
                "io.k8s.api.core.v1.Container": {
                    "type": "object",
                    "required": ["name"],
                    "properties": {
                        "name": { "type": "string" },
                        "resources": {
                            "type": "object",
                            "properties": {
                                "limits": { "type": "object", "additionalProperties": { "$ref": "#/definitions/io.k8s.apimachinery.pkg.api.resource.Quantity" } }
                            }
                        },
                        "ports": {
                            "type": "array",
                            "items": { "type": "object", "properties": { "targetPort": { "type": "string", "format": "int-or-string" } } }
                        }
                    }
                },
                "io.k8s.apimachinery.pkg.api.resource.Quantity": { "type": "string" },
                "io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "creationTimestamp": { "type": "string", "format": "date-time" }
                    }
                }
            }
        })
    }

    fn deployment(spec: Json) -> KubeObject {
        KubeObject::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "sensor", "creationTimestamp": null },
            "spec": spec,
        }))
        .unwrap()
    }

    #[test]
    fn valid_objects_have_no_issues() {
        let v = OpenApiValidator::from_openapi_v2(&openapi()).unwrap();
        let obj = deployment(json!({
            "replicas": 1,
            "template": { "spec": { "containers": [{
                "name": "sensor",
                "resources": { "limits": { "cpu": 2, "memory": "4Gi" } },
                "ports": [{ "targetPort": 8443 }, { "targetPort": "api" }]
            }] } }
        }));
        assert_eq!(v.validate(&obj).unwrap(), Some(vec![]));
    }

    #[test]
    fn type_and_required_violations_are_reported_with_paths() {
        let v = OpenApiValidator::from_openapi_v2(&openapi()).unwrap();
        let obj = deployment(json!({
            "replicas": "three",
            "template": { "spec": { "containers": [{ "image": "nginx" }] } }
        }));
        let issues = v.validate(&obj).unwrap().unwrap();
        assert!(issues.iter().any(|i| i.path == "/spec/replicas"));
        assert!(issues.iter().any(|i| i.path == "/spec/template/spec/containers/0" && i.error.contains("name")));
    }

    #[test]
    fn unknown_kinds_are_not_validated() {
        let v = OpenApiValidator::from_openapi_v2(&openapi()).unwrap();
        let obj = KubeObject::from_value(json!({
            "apiVersion": "security.openshift.io/v1", "kind": "SecurityContextConstraints", "metadata": { "name": "x" }
        }))
        .unwrap();
        assert!(!v.knows(&obj.gvk().unwrap()));
        assert_eq!(v.validate(&obj).unwrap(), None);
    }

    #[test]
    fn documents_without_definitions_are_rejected() {
        assert!(OpenApiValidator::from_openapi_v2(&json!({ "swagger": "2.0" })).is_err());
    }
}
