//! Object identity and the generic object document.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Group/Version/Kind triple. The core group is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Split an `apiVersion` string (`v1` or `apps/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Same group and kind, regardless of version.
    pub fn same_kind(&self, other: &Gvk) -> bool {
        self.group == other.group && self.kind == other.kind
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Identity of one object: GVK, namespace (None for cluster-scoped) and name.
/// Unique within any object set and used as a map key throughout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(gvk: Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self { gvk, namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name: name.to_string() }
    }

    pub fn namespaced(&self) -> bool {
        self.namespace.is_some()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

/// A Kubernetes object of any kind, held as an ordered JSON document.
///
/// Conversions to and from typed structs are explicit and fallible; nothing
/// assumes a closed set of kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KubeObject(Map<String, Json>);

impl KubeObject {
    pub fn from_value(v: Json) -> Result<Self> {
        match v {
            Json::Object(map) => Ok(Self(map)),
            other => Err(anyhow!("expected a JSON object, got {}", type_name(&other))),
        }
    }

    pub fn from_typed<T: Serialize>(typed: &T) -> Result<Self> {
        let v = serde_json::to_value(typed).context("serializing typed object")?;
        Self::from_value(v)
    }

    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Json::Object(self.0.clone())).context("converting object to typed form")
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let v: Json = serde_json::from_slice(bytes).context("parsing object JSON")?;
        Self::from_value(v)
    }

    pub fn into_value(self) -> Json {
        Json::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Json> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Json> {
        &mut self.0
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Json> {
        self.0.get_mut(key)
    }

    pub fn insert(&mut self, key: &str, value: Json) -> Option<Json> {
        self.0.insert(key.to_string(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Json> {
        self.0.remove(key)
    }

    /// JSON pointer lookup, e.g. `/spec/template/spec`.
    pub fn pointer(&self, path: &str) -> Option<&Json> {
        let mut segs = path.strip_prefix('/')?.split('/');
        let mut cur = self.0.get(segs.next()?)?;
        for seg in segs {
            cur = match cur {
                Json::Object(m) => m.get(seg)?,
                Json::Array(a) => a.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    pub fn api_version(&self) -> Option<&str> {
        self.0.get("apiVersion").and_then(Json::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(Json::as_str)
    }

    pub fn gvk(&self) -> Result<Gvk> {
        let api_version = self.api_version().ok_or_else(|| anyhow!("object missing apiVersion"))?;
        let kind = self.kind().ok_or_else(|| anyhow!("object missing kind"))?;
        Ok(Gvk::from_api_version(api_version, kind))
    }

    pub fn name(&self) -> Option<&str> {
        self.meta_str("name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta_str("namespace").filter(|ns| !ns.is_empty())
    }

    pub fn object_ref(&self) -> Result<ObjectRef> {
        let gvk = self.gvk()?;
        let name = self.name().ok_or_else(|| anyhow!("{} object missing metadata.name", gvk))?;
        Ok(ObjectRef::new(gvk, self.namespace(), name))
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get(key)).and_then(Json::as_str)
    }

    /// The metadata map, created if absent (or replaced if not an object).
    pub fn metadata_mut(&mut self) -> &mut Map<String, Json> {
        object_mut(self.0.entry("metadata").or_insert_with(|| Json::Object(Map::new())))
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map("labels")
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map("annotations")
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.get(key)).and_then(Json::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(Json::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.set_in_meta_map("labels", key, value);
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.set_in_meta_map("annotations", key, value);
    }

    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        let removed = self
            .metadata_mut()
            .get_mut("annotations")
            .and_then(Json::as_object_mut)
            .and_then(|a| a.remove(key));
        removed.and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta_str("resourceVersion").filter(|rv| !rv.is_empty())
    }

    pub fn set_resource_version(&mut self, rv: Option<&str>) {
        let meta = self.metadata_mut();
        match rv {
            Some(rv) => {
                meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
            }
            None => {
                meta.remove("resourceVersion");
            }
        }
    }

    /// Drop fields only the API server sets. Used on objects captured from a live
    /// cluster before they are submitted again.
    pub fn strip_server_fields(&mut self) {
        let meta = self.metadata_mut();
        for k in ["uid", "resourceVersion", "generation", "creationTimestamp", "managedFields", "selfLink"] {
            meta.remove(k);
        }
        self.0.remove("status");
    }

    fn string_map(&self, field: &str) -> BTreeMap<String, String> {
        self.0
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(Json::as_object)
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default()
    }

    fn set_in_meta_map(&mut self, field: &str, key: &str, value: &str) {
        let meta = self.metadata_mut();
        let entry = meta.entry(field).or_insert_with(|| Json::Object(Map::new()));
        if !entry.is_object() {
            *entry = Json::Object(Map::new());
        }
        if let Json::Object(m) = entry {
            m.insert(key.to_string(), Json::String(value.to_string()));
        }
    }
}

impl TryFrom<Json> for KubeObject {
    type Error = anyhow::Error;

    fn try_from(v: Json) -> Result<Self> {
        Self::from_value(v)
    }
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// View `v` as an object, replacing it with an empty one if it is not.
fn object_mut(v: &mut Json) -> &mut Map<String, Json> {
    match v {
        Json::Object(m) => m,
        other => {
            *other = Json::Object(Map::new());
            object_mut(other)
        }
    }
}
