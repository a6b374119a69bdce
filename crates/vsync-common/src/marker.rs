//! Ownership marker written onto every physical object the engine creates.
//!
//! The host namespace is shared across tenants, so the marker is the only
//! thing separating engine-owned objects from pre-existing or foreign ones.
//! External tooling targets engine-owned objects through the selectors
//! exported here; their format is part of the engine's public surface.

use std::collections::BTreeMap;

use crate::identity::{ObjectIdentity, ResourceKind};

/// Prefix reserved for engine metadata; never copied from virtual objects
pub const RESERVED_PREFIX: &str = "vsync.dev/";

/// Label naming the virtual cluster that owns a physical object
pub const LABEL_MANAGED_BY: &str = "vsync.dev/managed-by";

/// Label carrying the virtual namespace of a namespaced physical object
pub const LABEL_VIRTUAL_NAMESPACE: &str = "vsync.dev/namespace";

/// Annotation carrying the virtual object's name
pub const ANNOTATION_OBJECT_NAME: &str = "vsync.dev/object-name";

/// Annotation carrying the virtual object's namespace
pub const ANNOTATION_OBJECT_NAMESPACE: &str = "vsync.dev/object-namespace";

/// Annotation carrying the virtual object's kind (`Kind` or `Kind.group`)
pub const ANNOTATION_OBJECT_KIND: &str = "vsync.dev/object-kind";

/// Annotation listing the label keys copied from the virtual object
pub const ANNOTATION_MANAGED_LABELS: &str = "vsync.dev/managed-labels";

/// Annotation listing the annotation keys copied from the virtual object
pub const ANNOTATION_MANAGED_ANNOTATIONS: &str = "vsync.dev/managed-annotations";

/// Client-side apply bookkeeping that must not leak onto the host
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Whether a label or annotation key may be copied from a virtual object
pub fn is_copyable_key(key: &str) -> bool {
    !key.starts_with(RESERVED_PREFIX) && key != LAST_APPLIED_ANNOTATION
}

/// Label selector matching every physical object owned by a virtual cluster
pub fn managed_selector(vcluster_name: &str) -> String {
    format!("{LABEL_MANAGED_BY}={vcluster_name}")
}

/// Label selector matching the virtual cluster's own control-plane pods
pub fn workload_selector(release: &str) -> String {
    format!("app=vcluster,release={release}")
}

/// Marker labels for a physical object owned by `vcluster_name`
pub fn marker_labels(vcluster_name: &str, virtual_id: &ObjectIdentity) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), vcluster_name.to_string());
    if let Some(ns) = &virtual_id.namespace {
        labels.insert(LABEL_VIRTUAL_NAMESPACE.to_string(), ns.clone());
    }
    labels
}

/// Marker annotations naming the virtual owner of a physical object
pub fn marker_annotations(virtual_id: &ObjectIdentity) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_OBJECT_NAME.to_string(), virtual_id.name.clone());
    annotations.insert(ANNOTATION_OBJECT_KIND.to_string(), virtual_id.kind.to_string());
    if let Some(ns) = &virtual_id.namespace {
        annotations.insert(ANNOTATION_OBJECT_NAMESPACE.to_string(), ns.clone());
    }
    annotations
}

/// Whether the labels carry the marker for `vcluster_name`
pub fn has_marker(labels: Option<&BTreeMap<String, String>>, vcluster_name: &str) -> bool {
    labels
        .and_then(|l| l.get(LABEL_MANAGED_BY))
        .is_some_and(|owner| owner == vcluster_name)
}

/// Read the virtual owner recorded in a physical object's annotations.
///
/// Returns `None` when the name annotation is missing.
pub fn owner_from_annotations(
    kind: &ResourceKind,
    annotations: Option<&BTreeMap<String, String>>,
) -> Option<ObjectIdentity> {
    let annotations = annotations?;
    let name = annotations.get(ANNOTATION_OBJECT_NAME)?;
    let namespace = annotations
        .get(ANNOTATION_OBJECT_NAMESPACE)
        .filter(|ns| !ns.is_empty())
        .cloned();
    Some(ObjectIdentity {
        kind: kind.clone(),
        namespace,
        name: name.clone(),
    })
}

/// Parse a managed-keys annotation value into its key list
pub fn parse_managed_keys(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Render a key list for a managed-keys annotation (sorted, comma-joined)
pub fn render_managed_keys<'a>(keys: impl IntoIterator<Item = &'a String>) -> String {
    let mut keys: Vec<&String> = keys.into_iter().collect();
    keys.sort();
    keys.dedup();
    keys.into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}
