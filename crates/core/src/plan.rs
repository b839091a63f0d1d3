//! Execution plans: the create/update/delete actions reconciling live with desired state.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::object::{KubeObject, ObjectRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Create,
    Update,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }

    /// The verb needed to undo this one.
    pub fn inverse(&self) -> Verb {
        match self {
            Verb::Create => Verb::Delete,
            Verb::Update => Verb::Update,
            Verb::Delete => Verb::Create,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A desired object together with its (already validated) identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedObject {
    pub obj_ref: ObjectRef,
    pub object: KubeObject,
}

impl PlannedObject {
    pub fn new(object: KubeObject) -> Result<Self> {
        let obj_ref = object.object_ref()?;
        Ok(Self { obj_ref, object })
    }
}

/// One action of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDesc<'a> {
    pub verb: Verb,
    pub obj_ref: &'a ObjectRef,
    pub object: Option<&'a KubeObject>,
}

/// Creations and updates are kept in dependency order, deletions in reverse
/// dependency order. Updates carry the live object's resource version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub creations: Vec<PlannedObject>,
    pub updates: Vec<PlannedObject>,
    pub deletions: Vec<ObjectRef>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.creations.is_empty() && self.updates.is_empty() && self.deletions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creations.len() + self.updates.len() + self.deletions.len()
    }

    /// All actions in execution order: creations, then updates, then deletions.
    pub fn actions(&self) -> Vec<ActionDesc<'_>> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.creations.iter().map(|p| ActionDesc { verb: Verb::Create, obj_ref: &p.obj_ref, object: Some(&p.object) }));
        out.extend(self.updates.iter().map(|p| ActionDesc { verb: Verb::Update, obj_ref: &p.obj_ref, object: Some(&p.object) }));
        out.extend(self.deletions.iter().map(|r| ActionDesc { verb: Verb::Delete, obj_ref: r, object: None }));
        out
    }

    /// Objects to be written (creations and updates).
    pub fn objects(&self) -> impl Iterator<Item = &PlannedObject> {
        self.creations.iter().chain(self.updates.iter())
    }

    /// Check that no object appears in more than one action (or twice in one).
    pub fn check_disjoint(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for a in self.actions() {
            if !seen.insert(a.obj_ref) {
                return Err(anyhow!("object {} appears in more than one plan action", a.obj_ref));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!("{} creations, {} updates, {} deletions", self.creations.len(), self.updates.len(), self.deletions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Gvk;

    fn obj(kind: &str, name: &str) -> PlannedObject {
        PlannedObject::new(
            KubeObject::from_value(serde_json::json!({
                "apiVersion": "v1", "kind": kind, "metadata": { "name": name, "namespace": "stackrox" }
            }))
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn actions_follow_create_update_delete_order() {
        let plan = ExecutionPlan {
            creations: vec![obj("ServiceAccount", "a")],
            updates: vec![obj("ConfigMap", "b")],
            deletions: vec![ObjectRef::new(Gvk::new("", "v1", "Secret"), Some("stackrox"), "c")],
        };
        let verbs: Vec<Verb> = plan.actions().iter().map(|a| a.verb).collect();
        assert_eq!(verbs, vec![Verb::Create, Verb::Update, Verb::Delete]);
        assert!(plan.actions()[2].object.is_none());
        assert_eq!(plan.len(), 3);
        plan.check_disjoint().unwrap();
    }

    #[test]
    fn overlapping_actions_are_rejected() {
        let a = obj("ConfigMap", "a");
        let plan = ExecutionPlan { creations: vec![a.clone()], updates: vec![], deletions: vec![a.obj_ref.clone()] };
        assert!(plan.check_disjoint().is_err());
    }

    #[test]
    fn inverse_verbs() {
        assert_eq!(Verb::Create.inverse(), Verb::Delete);
        assert_eq!(Verb::Delete.inverse(), Verb::Create);
        assert_eq!(Verb::Update.inverse(), Verb::Update);
    }
}
