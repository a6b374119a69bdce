//! Object identities shared by the virtual and the host side.
//!
//! An [`ObjectIdentity`] is the triple (resource kind, namespace, name). The
//! same type names both the virtual object and its physical counterpart; the
//! Mapping Store keys on it in both directions.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ApiResource;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// API group plus Kind, e.g. `("", "ConfigMap")` or `("policy", "PodDisruptionBudget")`.
///
/// Versions are deliberately left out: a mapping recorded against `v1beta1`
/// must still resolve after the kind is served at `v1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// Kind name
    pub kind: String,
}

impl ResourceKind {
    /// Create a kind in the given API group
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// Create a kind in the core (`v1`) group
    pub fn core(kind: impl Into<String>) -> Self {
        Self::new("", kind)
    }

    /// Derive the kind from a discovered or hand-built API resource
    pub fn from_api_resource(ar: &ApiResource) -> Self {
        Self::new(ar.group.clone(), ar.kind.clone())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Identity of a single object on either side of the sync.
///
/// Immutable once assigned to a mapping.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIdentity {
    /// Resource kind of the object
    pub kind: ResourceKind,
    /// Namespace, `None` for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectIdentity {
    /// Identity of a namespaced object
    pub fn namespaced(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Identity of a cluster-scoped object
    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }

    /// Build an identity from object metadata.
    ///
    /// A missing or empty name is a translation error: the object is malformed
    /// and retrying will not fix it.
    pub fn from_meta(kind: ResourceKind, meta: &ObjectMeta) -> Result<Self> {
        let name = meta
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::translation_for_field(
                    kind.to_string(),
                    "metadata.name",
                    "object has no name",
                )
            })?;

        let namespace = meta.namespace.clone().filter(|ns| !ns.is_empty());
        Ok(Self {
            kind,
            namespace,
            name: name.to_string(),
        })
    }

    /// Whether this identity names a namespaced object
    pub fn is_namespaced(&self) -> bool {
        self.namespace.is_some()
    }

    /// Namespace as `&str`, empty for cluster-scoped identities
    pub fn namespace_str(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}
