//! Per-kind mapper registration.
//!
//! Each synced kind has its own registration function; [`register_all`]
//! invokes the enabled subset and stops at the first failure.

mod configmaps;
mod endpoints;
mod ingressclasses;
mod persistentvolumeclaims;
mod poddisruptionbudgets;
mod secrets;
mod serviceaccounts;
mod services;
mod volumesnapshotclasses;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;
use vsync_common::{Error, ResourceKind, Result};

use crate::naming::NameTranslator;
use crate::MapperRegistry;

pub use configmaps::register_configmaps_mapper;
pub use endpoints::register_endpoints_mapper;
pub use ingressclasses::register_ingressclasses_mapper;
pub use persistentvolumeclaims::register_persistentvolumeclaims_mapper;
pub use poddisruptionbudgets::register_poddisruptionbudgets_mapper;
pub use secrets::register_secrets_mapper;
pub use serviceaccounts::register_serviceaccounts_mapper;
pub use services::register_services_mapper;
pub use volumesnapshotclasses::{
    register_volumesnapshotclasses_mapper, volume_snapshot_class_resource,
};

/// Inputs shared by every registration call
#[derive(Clone)]
pub struct RegisterContext {
    /// Name translation used by namespaced-rewrite kinds
    pub name_translator: Arc<dyn NameTranslator>,
}

impl RegisterContext {
    /// Context using the given translator
    pub fn new(name_translator: Arc<dyn NameTranslator>) -> Self {
        Self { name_translator }
    }
}

/// Kinds the syncer knows how to map
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncedKind {
    /// v1 ConfigMap
    ConfigMaps,
    /// v1 Secret
    Secrets,
    /// v1 Service
    Services,
    /// v1 Endpoints
    Endpoints,
    /// v1 ServiceAccount
    ServiceAccounts,
    /// v1 PersistentVolumeClaim
    PersistentVolumeClaims,
    /// policy/v1 PodDisruptionBudget
    PodDisruptionBudgets,
    /// snapshot.storage.k8s.io/v1 VolumeSnapshotClass
    VolumeSnapshotClasses,
    /// networking.k8s.io/v1 IngressClass
    IngressClasses,
}

type RegisterFn = fn(&mut MapperRegistry, &RegisterContext) -> Result<()>;

impl SyncedKind {
    /// Every known kind
    pub const ALL: &'static [SyncedKind] = &[
        SyncedKind::ConfigMaps,
        SyncedKind::Secrets,
        SyncedKind::Services,
        SyncedKind::Endpoints,
        SyncedKind::ServiceAccounts,
        SyncedKind::PersistentVolumeClaims,
        SyncedKind::PodDisruptionBudgets,
        SyncedKind::VolumeSnapshotClasses,
        SyncedKind::IngressClasses,
    ];

    /// Lowercase plural name, as accepted on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigMaps => "configmaps",
            Self::Secrets => "secrets",
            Self::Services => "services",
            Self::Endpoints => "endpoints",
            Self::ServiceAccounts => "serviceaccounts",
            Self::PersistentVolumeClaims => "persistentvolumeclaims",
            Self::PodDisruptionBudgets => "poddisruptionbudgets",
            Self::VolumeSnapshotClasses => "volumesnapshotclasses",
            Self::IngressClasses => "ingressclasses",
        }
    }

    /// Resource kind served by this entry
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            Self::ConfigMaps => ResourceKind::core("ConfigMap"),
            Self::Secrets => ResourceKind::core("Secret"),
            Self::Services => ResourceKind::core("Service"),
            Self::Endpoints => ResourceKind::core("Endpoints"),
            Self::ServiceAccounts => ResourceKind::core("ServiceAccount"),
            Self::PersistentVolumeClaims => ResourceKind::core("PersistentVolumeClaim"),
            Self::PodDisruptionBudgets => ResourceKind::new("policy", "PodDisruptionBudget"),
            Self::VolumeSnapshotClasses => {
                ResourceKind::new("snapshot.storage.k8s.io", "VolumeSnapshotClass")
            }
            Self::IngressClasses => ResourceKind::new("networking.k8s.io", "IngressClass"),
        }
    }

    /// Whether the kind is mirrored one-to-one rather than rewritten
    pub fn is_mirror(&self) -> bool {
        matches!(self, Self::VolumeSnapshotClasses | Self::IngressClasses)
    }

    fn register_fn(&self) -> RegisterFn {
        match self {
            Self::ConfigMaps => register_configmaps_mapper,
            Self::Secrets => register_secrets_mapper,
            Self::Services => register_services_mapper,
            Self::Endpoints => register_endpoints_mapper,
            Self::ServiceAccounts => register_serviceaccounts_mapper,
            Self::PersistentVolumeClaims => register_persistentvolumeclaims_mapper,
            Self::PodDisruptionBudgets => register_poddisruptionbudgets_mapper,
            Self::VolumeSnapshotClasses => register_volumesnapshotclasses_mapper,
            Self::IngressClasses => register_ingressclasses_mapper,
        }
    }
}

impl fmt::Display for SyncedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncedKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| {
                Error::validation_for_field("--resources", format!("unknown resource kind '{s}'"))
            })
    }
}

/// Register mappers for the given kinds, in order.
///
/// Startup must abort on error: a duplicate or failed registration means the
/// process would run with an inconsistent registry.
pub fn register_all(
    registry: &mut MapperRegistry,
    ctx: &RegisterContext,
    kinds: &[SyncedKind],
) -> Result<()> {
    for kind in kinds {
        (kind.register_fn())(registry, ctx)?;
    }
    info!(
        mappers = registry.len(),
        kinds = %kinds.iter().map(SyncedKind::as_str).collect::<Vec<_>>().join(","),
        "registered mappers"
    );
    Ok(())
}
