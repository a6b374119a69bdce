//! Per-kind sync options.

use vsync_mappings::SyncedKind;

/// Marks the cluster-wide default IngressClass
pub const DEFAULT_INGRESS_CLASS_ANNOTATION: &str = "ingressclass.kubernetes.io/is-default-class";

/// Marks the cluster-wide default VolumeSnapshotClass
pub const DEFAULT_SNAPSHOT_CLASS_ANNOTATION: &str =
    "snapshot.storage.kubernetes.io/is-default-class";

/// A label selector that is narrowed to the tenant on the host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectorPath {
    /// Path of the selector object; nothing is scoped while it is absent
    pub selector: &'static [&'static str],
    /// Label map inside the selector, created when missing. `None` when the
    /// selector object is itself the label map.
    pub match_labels: Option<&'static str>,
}

/// Which parts of an object the engine owns for a kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    /// Top-level body fields copied from the virtual object and kept in sync
    pub owned_fields: &'static [&'static str],
    /// Nested paths assigned by the host; never written or compared
    pub excluded_paths: &'static [&'static [&'static str]],
    /// Selectors that get the marker and namespace labels added, so they only
    /// select this tenant's objects on the host
    pub selector_paths: &'static [SelectorPath],
    /// Copy host `status` back to the virtual object
    pub propagate_status: bool,
    /// Virtual annotations never copied to the host. Mirrored objects are
    /// shared by every tenant, so host-wide switches stay out of their reach.
    pub denied_annotations: &'static [&'static str],
}

impl SyncOptions {
    const fn fields(owned_fields: &'static [&'static str]) -> Self {
        Self {
            owned_fields,
            excluded_paths: &[],
            selector_paths: &[],
            propagate_status: false,
            denied_annotations: &[],
        }
    }

    const fn denying(mut self, denied_annotations: &'static [&'static str]) -> Self {
        self.denied_annotations = denied_annotations;
        self
    }
}

/// Options for a synced kind
pub fn sync_options(kind: SyncedKind) -> SyncOptions {
    match kind {
        SyncedKind::ConfigMaps => SyncOptions::fields(&["data", "binaryData", "immutable"]),
        SyncedKind::Secrets => SyncOptions::fields(&["type", "data", "immutable"]),
        SyncedKind::Services => SyncOptions {
            owned_fields: &["spec"],
            excluded_paths: &[
                &["spec", "clusterIP"],
                &["spec", "clusterIPs"],
                &["spec", "ipFamilies"],
                &["spec", "ipFamilyPolicy"],
            ],
            // A Service without a selector has manually managed endpoints
            selector_paths: &[SelectorPath {
                selector: &["spec", "selector"],
                match_labels: None,
            }],
            propagate_status: true,
            denied_annotations: &[],
        },
        SyncedKind::Endpoints => SyncOptions::fields(&["subsets"]),
        // imagePullSecrets name virtual Secrets and would dangle on the host
        SyncedKind::ServiceAccounts => SyncOptions::fields(&["automountServiceAccountToken"]),
        SyncedKind::PersistentVolumeClaims => SyncOptions {
            owned_fields: &["spec"],
            excluded_paths: &[&["spec", "volumeName"]],
            selector_paths: &[],
            propagate_status: true,
            denied_annotations: &[],
        },
        SyncedKind::PodDisruptionBudgets => SyncOptions {
            owned_fields: &["spec"],
            excluded_paths: &[],
            selector_paths: &[SelectorPath {
                selector: &["spec", "selector"],
                match_labels: Some("matchLabels"),
            }],
            propagate_status: true,
            denied_annotations: &[],
        },
        SyncedKind::VolumeSnapshotClasses => {
            SyncOptions::fields(&["driver", "deletionPolicy", "parameters"])
                .denying(&[DEFAULT_SNAPSHOT_CLASS_ANNOTATION])
        }
        SyncedKind::IngressClasses => {
            SyncOptions::fields(&["spec"]).denying(&[DEFAULT_INGRESS_CLASS_ANNOTATION])
        }
    }
}
