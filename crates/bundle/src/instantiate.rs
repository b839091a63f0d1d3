//! Bundle instantiation: bundle files to cluster objects. Pure; nothing here
//! touches the cluster.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use keel_core::{
    BundleRegistry, DynamicKind, DynamicObjectDesc, KubeObject, UpgraderConfig, COMPONENT_LABEL_KEY, COMPONENT_LABEL_VALUE,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::{Map, Value as Json};
use tracing::{debug, info};

use crate::contents::{BundleContents, TrackingContents};

/// Turn bundle contents into the desired object list.
///
/// Dynamic objects come first (registry order), then the documents of every
/// `*.yaml` file in path order. Fails on any parse error, on bundle files that
/// were neither consumed nor ignorable, and on objects without the ownership
/// label.
pub fn instantiate(contents: &dyn BundleContents, registry: &BundleRegistry, config: &UpgraderConfig) -> Result<Vec<KubeObject>> {
    let tracking = TrackingContents::new(contents);
    let mut objects = Vec::new();

    for desc in &registry.dynamic_objects {
        if let Some(obj) = instantiate_dynamic(&tracking, desc, &config.namespace)? {
            objects.push(obj);
        }
    }

    for path in tracking.paths().into_iter().filter(|p| p.ends_with(".yaml")) {
        let bytes = tracking.read_all(&path)?.ok_or_else(|| anyhow!("bundle file {} vanished", path))?;
        let docs = parse_documents(&bytes).with_context(|| format!("parsing bundle file {}", path))?;
        debug!(path = %path, objects = docs.len(), "parsed bundle file");
        objects.extend(docs);
    }

    let opened = tracking.opened();
    let neglected: Vec<String> = tracking.paths().into_iter().filter(|p| !opened.contains(p) && !registry.is_ignored(p)).collect();
    if !neglected.is_empty() {
        return Err(anyhow!("bundle contains unrecognized files: {}", neglected.join(", ")));
    }

    let mut kept = Vec::with_capacity(objects.len());
    let mut seen = BTreeSet::new();
    for obj in objects {
        let r = obj.object_ref()?;
        if registry.is_additional_ca(&r) {
            debug!(object = %r, "dropping transient additional CA secret");
            continue;
        }
        if !seen.insert(r.clone()) {
            return Err(anyhow!("bundle defines {} more than once", r));
        }
        if obj.label(COMPONENT_LABEL_KEY) != Some(COMPONENT_LABEL_VALUE) && !config.is_label_exempt(&r) {
            return Err(anyhow!("object {} lacks label {}={}", r, COMPONENT_LABEL_KEY, COMPONENT_LABEL_VALUE));
        }
        kept.push(obj);
    }

    if config.cert_rotation_only {
        let before = kept.len();
        kept.retain(|o| o.object_ref().map(|r| registry.is_cert_object(&r)).unwrap_or(false));
        info!(before, after = kept.len(), "certificate rotation only: keeping certificate objects");
    }

    counter!("upgrader_bundle_objects_total", kept.len() as u64);
    Ok(kept)
}

/// Parse a multi-document YAML stream. Empty documents are skipped; every other
/// document must be a well-formed object with apiVersion, kind and name.
pub fn parse_documents(bytes: &[u8]) -> Result<Vec<KubeObject>> {
    let mut out = Vec::new();
    for (idx, de) in serde_yaml::Deserializer::from_slice(bytes).enumerate() {
        let doc = serde_yaml::Value::deserialize(de).with_context(|| format!("document {}: invalid YAML", idx))?;
        if doc.is_null() {
            continue;
        }
        let json = serde_json::to_value(doc).with_context(|| format!("document {}: converting YAML to JSON", idx))?;
        let obj = KubeObject::from_value(json).with_context(|| format!("document {}", idx))?;
        obj.object_ref().with_context(|| format!("document {}", idx))?;
        out.push(obj);
    }
    Ok(out)
}

fn instantiate_dynamic(contents: &dyn BundleContents, desc: &DynamicObjectDesc, namespace: &str) -> Result<Option<KubeObject>> {
    if desc.optional {
        if let Some(missing) = desc.files.iter().find(|f| !contents.contains(f)) {
            info!(object = %desc.name, missing = %missing, "optional bundle object skipped: source file missing");
            return Ok(None);
        }
    }

    let mut strings = Map::new();
    let mut binary = Map::new();
    for file in &desc.files {
        let bytes = contents
            .read_all(file)?
            .ok_or_else(|| anyhow!("bundle file {} required for {} is missing", file, desc.name))?;
        match String::from_utf8(bytes) {
            Ok(s) => {
                strings.insert(file.clone(), Json::String(s));
            }
            Err(e) => {
                binary.insert(file.clone(), Json::String(B64.encode(e.into_bytes())));
            }
        }
    }

    let metadata = serde_json::json!({
        "name": desc.name,
        "namespace": namespace,
        "labels": { COMPONENT_LABEL_KEY: COMPONENT_LABEL_VALUE },
    });
    let mut obj = match desc.kind {
        DynamicKind::Secret => serde_json::json!({
            "apiVersion": "v1", "kind": "Secret", "type": "Opaque", "metadata": metadata,
        }),
        DynamicKind::ConfigMap => serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": metadata,
        }),
    };
    let (string_field, binary_field) = match desc.kind {
        DynamicKind::Secret => ("stringData", "data"),
        DynamicKind::ConfigMap => ("data", "binaryData"),
    };
    if !strings.is_empty() {
        obj[string_field] = Json::Object(strings);
    }
    if !binary.is_empty() {
        obj[binary_field] = Json::Object(binary);
    }
    Ok(Some(KubeObject::from_value(obj)?))
}
