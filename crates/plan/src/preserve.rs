//! Carry container resource sizing from live workloads into their desired
//! replacements, for workloads that opted in with the preserve annotation.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{PodTemplateSpec, ResourceRequirements};
use keel_core::{KubeObject, PRESERVE_RESOURCES_ANNOTATION_KEY};
use serde_json::{Map, Value as Json};

const SIZING_FIELDS: &[&str] = &["limits", "requests"];

/// Whether the live object asks for its sizing to survive upgrades.
pub fn wants_preserved_resources(live: &KubeObject) -> bool {
    live.annotation(PRESERVE_RESOURCES_ANNOTATION_KEY).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn pod_template(obj: &KubeObject) -> Result<Option<PodTemplateSpec>> {
    match obj.kind() {
        Some("Deployment") => Ok(obj.to_typed::<Deployment>()?.spec.map(|s| s.template)),
        Some("DaemonSet") => Ok(obj.to_typed::<DaemonSet>()?.spec.map(|s| s.template)),
        other => Err(anyhow!("resource preservation does not apply to kind {:?}", other)),
    }
}

fn container_resources(template: &PodTemplateSpec) -> BTreeMap<String, ResourceRequirements> {
    let Some(pod) = &template.spec else {
        return BTreeMap::new();
    };
    pod.init_containers
        .iter()
        .flatten()
        .chain(pod.containers.iter())
        .filter_map(|c| c.resources.clone().map(|r| (c.name.clone(), r)))
        .collect()
}

/// Merge live container `limits`/`requests` into `desired`, matching
/// containers by name. Keys set on the live side win; keys only the desired
/// side has are kept. Workloads of other kinds are an error.
pub fn merge_preserved_resources(desired: &mut KubeObject, live: &KubeObject) -> Result<()> {
    let Some(template) = pod_template(live)? else {
        return Ok(());
    };
    // validate the desired side parses too before touching it
    pod_template(desired)?;
    let sized = container_resources(&template);
    if sized.is_empty() {
        return Ok(());
    }

    let Some(pod) = desired.get_mut("spec").and_then(|s| s.get_mut("template")).and_then(|t| t.get_mut("spec")) else {
        return Ok(());
    };
    for field in ["initContainers", "containers"] {
        let Some(containers) = pod.get_mut(field).and_then(Json::as_array_mut) else {
            continue;
        };
        for container in containers.iter_mut().filter_map(Json::as_object_mut) {
            let Some(name) = container.get("name").and_then(Json::as_str) else {
                continue;
            };
            let Some(live_res) = sized.get(name) else {
                continue;
            };
            let preserved = serde_json::to_value(live_res)?;
            let target = container.entry("resources").or_insert_with(|| Json::Object(Map::new()));
            if !target.is_object() {
                *target = Json::Object(Map::new());
            }
            for section in SIZING_FIELDS {
                let Some(src) = preserved.get(*section).and_then(Json::as_object) else {
                    continue;
                };
                if let Some(target) = target.as_object_mut() {
                    let dst = target.entry(*section).or_insert_with(|| Json::Object(Map::new()));
                    if !dst.is_object() {
                        *dst = Json::Object(Map::new());
                    }
                    if let Some(dst) = dst.as_object_mut() {
                        for (k, v) in src {
                            dst.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
