//! Object state as the scheduler sees it.
//!
//! Only the fields the commit path reads or writes are modelled: placement
//! (node name, nominated node), status conditions and labels.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sked_id::{ObjectKey, ObjectKind};

/// Status of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A single status condition, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: None,
            message: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Last known state of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectState {
    pub key: ObjectKey,
    pub uid: String,
    /// Bumped by the remote API on every successful write.
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nominated_node_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ObjectState {
    /// A fresh object with no placement and no status.
    pub fn new(key: ObjectKey, uid: impl Into<String>) -> Self {
        Self {
            key,
            uid: uid.into(),
            resource_version: 0,
            node_name: None,
            nominated_node_name: None,
            conditions: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node_name = Some(node.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_bound(&self) -> bool {
        self.node_name.is_some()
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace a condition by type.
    pub fn set_condition(&mut self, condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

/// Reference to the object a binding points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub kind: ObjectKind,
    pub name: String,
}

/// Assignment of an object to a node, written as a subresource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub key: ObjectKey,
    /// Precondition: only bind if the remote object still has this uid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub target: ObjectReference,
}

impl Binding {
    /// Binding of `object` to the node named `node`.
    pub fn to_node(object: &ObjectState, node: impl Into<String>) -> Self {
        Self {
            key: object.key.clone(),
            uid: (!object.uid.is_empty()).then(|| object.uid.clone()),
            target: ObjectReference {
                kind: ObjectKind::Node,
                name: node.into(),
            },
        }
    }

    pub fn node_name(&self) -> &str {
        &self.target.name
    }
}

/// Nominated node change carried by a status patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NominatedNode {
    Set(String),
    Clear,
}

/// Partial status update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPatch {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nominated_node: Option<NominatedNode>,
}

impl StatusPatch {
    pub fn condition(condition: Condition) -> Self {
        Self {
            conditions: vec![condition],
            nominated_node: None,
        }
    }

    pub fn nominate(node: impl Into<String>) -> Self {
        Self {
            conditions: Vec::new(),
            nominated_node: Some(NominatedNode::Set(node.into())),
        }
    }

    /// Folds `newer` on top of `self`.
    ///
    /// Conditions merge by type with `newer` winning; the nominated node is
    /// taken from `newer` only when `newer` sets it.
    pub fn merge(mut self, newer: StatusPatch) -> StatusPatch {
        for condition in newer.conditions {
            match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
                Some(existing) => *existing = condition,
                None => self.conditions.push(condition),
            }
        }
        if newer.nominated_node.is_some() {
            self.nominated_node = newer.nominated_node;
        }
        self
    }

    /// Applies the patch to an object, returning the patched copy.
    pub fn apply_to(&self, object: &ObjectState) -> ObjectState {
        let mut patched = object.clone();
        for condition in &self.conditions {
            patched.set_condition(condition.clone());
        }
        match &self.nominated_node {
            Some(NominatedNode::Set(node)) => patched.nominated_node_name = Some(node.clone()),
            Some(NominatedNode::Clear) => patched.nominated_node_name = None,
            None => {}
        }
        patched
    }
}

/// Options for deleting an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    /// Precondition: only delete if the remote object still has this uid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}
