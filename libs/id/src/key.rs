//! Object keys: the stable address of a remote object.
//!
//! Canonical form is `{kind}/{namespace}/{name}` for namespaced kinds and
//! `{kind}/{name}` for cluster-scoped kinds, e.g. `pod/default/web-0` or
//! `node/worker-1`.

use std::fmt;
use std::str::FromStr;

use crate::IdError;

/// Kinds of remote objects the scheduler writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Pod,
    Node,
    ResourceClaim,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 3] = [Self::Pod, Self::Node, Self::ResourceClaim];

    /// Returns true if objects of this kind live inside a namespace.
    pub fn is_namespaced(&self) -> bool {
        match self {
            Self::Pod | Self::ResourceClaim => true,
            Self::Node => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Node => "node",
            Self::ResourceClaim => "resourceclaim",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| IdError::UnknownKind(s.to_string()))
    }
}

/// Address of one remote object.
///
/// Two calls with equal keys target the same object and are strictly
/// ordered by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    kind: ObjectKind,
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    /// Builds a key for a namespaced kind.
    ///
    /// Panics in debug builds if `kind` is cluster-scoped.
    pub fn namespaced(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        debug_assert!(kind.is_namespaced(), "{kind} is cluster-scoped");
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Builds a key for a cluster-scoped kind.
    pub fn cluster(kind: ObjectKind, name: impl Into<String>) -> Self {
        debug_assert!(!kind.is_namespaced(), "{kind} is namespaced");
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }

    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::namespaced(ObjectKind::Pod, namespace, name)
    }

    pub fn node(name: impl Into<String>) -> Self {
        Self::cluster(ObjectKind::Node, name)
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parses the canonical `kind/[namespace/]name` form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let invalid = |message: &str| IdError::InvalidKey {
            key: s.to_string(),
            message: message.to_string(),
        };

        let mut parts = s.split('/');
        let kind: ObjectKind = parts.next().unwrap_or_default().parse()?;
        let rest: Vec<&str> = parts.collect();

        if rest.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty path segment"));
        }

        match (kind.is_namespaced(), rest.as_slice()) {
            (true, [namespace, name]) => Ok(Self::namespaced(kind, *namespace, *name)),
            (false, [name]) => Ok(Self::cluster(kind, *name)),
            (true, _) => Err(invalid("expected kind/namespace/name")),
            (false, _) => Err(invalid("expected kind/name")),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ObjectKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for ObjectKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for ObjectKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ObjectKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
