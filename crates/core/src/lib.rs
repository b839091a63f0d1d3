//! Keel core types shared by every stage of the upgrader.
//!
//! Objects are carried around as schema-less JSON documents ([`KubeObject`]) and
//! identified by [`ObjectRef`]. Typed `k8s-openapi` structs are only produced on
//! demand, through the fallible conversions on [`KubeObject`].

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod object;
pub mod plan;
pub mod tables;

pub use config::{UpgraderConfig, DEFAULT_NAMESPACE};
pub use error::ClusterError;
pub use object::{Gvk, KubeObject, ObjectRef};
pub use plan::{ActionDesc, ExecutionPlan, PlannedObject, Verb};
pub use tables::{BundleRegistry, DynamicKind, DynamicObjectDesc, KindOrder};

/// Ownership label every managed object carries.
pub const COMPONENT_LABEL_KEY: &str = "auto-upgrade.stackrox.io/component";
pub const COMPONENT_LABEL_VALUE: &str = "sensor";

/// Label tying upgrader state objects (snapshots) to one upgrade attempt.
pub const PROCESS_ID_LABEL_KEY: &str = "auto-upgrade.stackrox.io/process-id";
/// Marks objects that hold upgrader state rather than deployment footprint.
pub const UPGRADE_RESOURCE_LABEL_KEY: &str = "auto-upgrade.stackrox.io/upgrade-resource";
pub const UPGRADE_RESOURCE_LABEL_VALUE: &str = "true";

/// Stamped on every object the executor creates or updates.
pub const LAST_UPGRADE_ID_ANNOTATION_KEY: &str = "auto-upgrade.stackrox.io/last-upgrade-id";
/// Opt-in on live workloads: keep their container resource sizing across upgrades.
pub const PRESERVE_RESOURCES_ANNOTATION_KEY: &str = "auto-upgrade.stackrox.io/preserve-resources";

/// Label selector matching all managed (owned) objects.
pub fn component_selector() -> String {
    format!("{}={}", COMPONENT_LABEL_KEY, COMPONENT_LABEL_VALUE)
}
