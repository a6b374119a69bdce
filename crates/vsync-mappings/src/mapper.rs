//! Identity Mapper: one strategy per resource kind.
//!
//! A kind's behaviour is a [`MapperStrategy`] chosen at registration time,
//! not a type hierarchy. The forward direction is a pure function of the
//! virtual identity; the reverse direction of a namespaced rewrite cannot be
//! computed from the hashed name and goes through the [`MappingStore`].

use std::fmt;
use std::sync::Arc;

use kube::api::ApiResource;
use vsync_common::{Error, ObjectIdentity, ResourceKind, Result};

use crate::naming::NameTranslator;
use crate::store::MappingStore;

/// Naming strategy of a resource kind
#[derive(Clone)]
pub enum MapperStrategy {
    /// Tenant-scoped kinds rewritten into the shared target namespace
    Namespaced(Arc<dyn NameTranslator>),
    /// Cluster-scoped singleton kinds synced one-to-one
    Mirror,
}

impl fmt::Debug for MapperStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapperStrategy::Namespaced(_) => f.write_str("Namespaced"),
            MapperStrategy::Mirror => f.write_str("Mirror"),
        }
    }
}

/// Stateless identity mapper for a single resource kind
#[derive(Clone, Debug)]
pub struct Mapper {
    kind: ResourceKind,
    api_resource: ApiResource,
    strategy: MapperStrategy,
}

impl Mapper {
    /// Mapper rewriting namespaced objects with the given translator
    pub fn namespaced(api_resource: ApiResource, translator: Arc<dyn NameTranslator>) -> Self {
        Self {
            kind: ResourceKind::from_api_resource(&api_resource),
            api_resource,
            strategy: MapperStrategy::Namespaced(translator),
        }
    }

    /// Mapper for a cluster-scoped kind whose physical identity equals the virtual one
    pub fn mirror(api_resource: ApiResource) -> Self {
        Self {
            kind: ResourceKind::from_api_resource(&api_resource),
            api_resource,
            strategy: MapperStrategy::Mirror,
        }
    }

    /// Resource kind this mapper serves
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// API resource used to build dynamic clients for this kind
    pub fn api_resource(&self) -> &ApiResource {
        &self.api_resource
    }

    /// Naming strategy
    pub fn strategy(&self) -> &MapperStrategy {
        &self.strategy
    }

    /// Whether objects of this kind live in a namespace
    pub fn is_namespaced(&self) -> bool {
        matches!(self.strategy, MapperStrategy::Namespaced(_))
    }

    /// Compute the physical identity for a virtual identity.
    ///
    /// Pure: the same input always yields the same output. Collisions are
    /// detected later by [`MappingStore::record`], never here.
    pub fn physical_identity(&self, virtual_id: &ObjectIdentity) -> Result<ObjectIdentity> {
        self.check_kind(virtual_id)?;

        match &self.strategy {
            MapperStrategy::Namespaced(translator) => {
                let namespace = virtual_id.namespace.as_deref().ok_or_else(|| {
                    Error::translation_for_field(
                        virtual_id.to_string(),
                        "metadata.namespace",
                        "namespaced kind without a namespace",
                    )
                })?;
                Ok(ObjectIdentity::namespaced(
                    self.kind.clone(),
                    translator.physical_namespace(namespace),
                    translator.physical_name(&virtual_id.name, namespace),
                ))
            }
            MapperStrategy::Mirror => {
                if virtual_id.is_namespaced() {
                    return Err(Error::translation_for_field(
                        virtual_id.to_string(),
                        "metadata.namespace",
                        "cluster-scoped kind with a namespace",
                    ));
                }
                Ok(virtual_id.clone())
            }
        }
    }

    /// Resolve the virtual owner of a physical identity.
    ///
    /// Mirror kinds map back to themselves; namespaced kinds consult the
    /// store's reverse index and fail with `NotFound` when unmapped.
    pub fn virtual_identity(
        &self,
        physical_id: &ObjectIdentity,
        store: &MappingStore,
    ) -> Result<ObjectIdentity> {
        self.check_kind(physical_id)?;

        match &self.strategy {
            MapperStrategy::Namespaced(_) => store.reverse_lookup(physical_id),
            MapperStrategy::Mirror => Ok(physical_id.clone()),
        }
    }

    fn check_kind(&self, id: &ObjectIdentity) -> Result<()> {
        if id.kind != self.kind {
            return Err(Error::internal_with_context(
                "mapper",
                format!("{} mapper asked to map {}", self.kind, id),
            ));
        }
        Ok(())
    }
}
