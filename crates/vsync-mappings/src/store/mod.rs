//! Mapping Store
//!
//! Source of truth for virtual ↔ physical identity associations. Two
//! in-memory indices serve lookups; a [`MappingBackend`] persists every
//! record so identities survive restarts.
//!
//! The reverse index is the only serialization point in the engine: `record`
//! claims the physical identity with a compare-and-set on its `DashMap`
//! entry, so two virtual objects whose names collide cannot both win. Nothing
//! in here retries; callers own the retry policy.

pub mod backend;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use vsync_common::{Error, ObjectIdentity, ResourceKind, Result};

pub use backend::{ConfigMapBackend, MappingBackend, MemoryBackend};

/// Persisted association between a virtual object and its physical counterpart
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    /// Identity inside the virtual cluster
    pub virtual_identity: ObjectIdentity,
    /// Identity on the host cluster
    pub physical_identity: ObjectIdentity,
    /// Kind shared by both identities
    pub resource_kind: ResourceKind,
    /// When the mapping was first recorded
    pub created_at: DateTime<Utc>,
}

impl Mapping {
    /// New mapping stamped with the current time
    pub fn new(virtual_identity: ObjectIdentity, physical_identity: ObjectIdentity) -> Self {
        Self {
            resource_kind: virtual_identity.kind.clone(),
            virtual_identity,
            physical_identity,
            created_at: Utc::now(),
        }
    }

    /// Key under which this mapping is persisted
    pub fn storage_key(&self) -> String {
        storage_key(&self.virtual_identity)
    }
}

/// Persistence key for a virtual identity: SHA-256 hex of (group, kind, namespace, name).
///
/// Valid as a ConfigMap data key and unique per (resource kind, virtual identity).
pub fn storage_key(virtual_id: &ObjectIdentity) -> String {
    let mut hasher = Sha256::new();
    for part in [
        virtual_id.kind.group.as_str(),
        virtual_id.kind.kind.as_str(),
        virtual_id.namespace_str(),
        virtual_id.name.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Bidirectional, persisted identity index
pub struct MappingStore {
    forward: DashMap<ObjectIdentity, Mapping>,
    reverse: DashMap<ObjectIdentity, ObjectIdentity>,
    backend: Arc<dyn MappingBackend>,
}

impl MappingStore {
    /// Load every persisted mapping and build the indices.
    ///
    /// Records are applied oldest first. When two records claim the same
    /// physical identity the older one wins and the newer is skipped with a
    /// warning; its owner will hit a conflict on its next reconcile.
    pub async fn open(backend: Arc<dyn MappingBackend>) -> Result<Self> {
        let mut records = backend.load().await?;
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.virtual_identity.cmp(&b.virtual_identity))
        });

        let store = Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
            backend,
        };

        let mut skipped = 0usize;
        for mapping in records {
            if let Some(owner) = store.reverse.get(&mapping.physical_identity) {
                warn!(
                    physical = %mapping.physical_identity,
                    claimed_by = %*owner,
                    skipped = %mapping.virtual_identity,
                    "persisted mapping conflicts with an older record, skipping"
                );
                skipped += 1;
                continue;
            }
            store.reverse.insert(
                mapping.physical_identity.clone(),
                mapping.virtual_identity.clone(),
            );
            store
                .forward
                .insert(mapping.virtual_identity.clone(), mapping);
        }

        info!(
            mappings = store.forward.len(),
            skipped, "mapping store loaded"
        );
        Ok(store)
    }

    /// Physical identity for a virtual identity
    pub fn lookup(&self, virtual_id: &ObjectIdentity) -> Result<ObjectIdentity> {
        self.forward
            .get(virtual_id)
            .map(|m| m.physical_identity.clone())
            .ok_or_else(|| Error::not_found(virtual_id))
    }

    /// Virtual identity owning a physical identity
    pub fn reverse_lookup(&self, physical_id: &ObjectIdentity) -> Result<ObjectIdentity> {
        self.reverse
            .get(physical_id)
            .map(|v| v.clone())
            .ok_or_else(|| Error::not_found(physical_id))
    }

    /// Full mapping record for a virtual identity
    pub fn get(&self, virtual_id: &ObjectIdentity) -> Option<Mapping> {
        self.forward.get(virtual_id).map(|m| m.clone())
    }

    /// Record an association and persist it before returning.
    ///
    /// Re-recording an existing pair is a no-op. Fails with `Conflict` when
    /// the physical identity belongs to another virtual identity. If the
    /// backend write fails the reservation is released and the error returned.
    pub async fn record(
        &self,
        virtual_id: &ObjectIdentity,
        physical_id: &ObjectIdentity,
    ) -> Result<Mapping> {
        if virtual_id.kind != physical_id.kind {
            return Err(Error::internal_with_context(
                "mapping-store",
                format!("kind mismatch between {virtual_id} and {physical_id}"),
            ));
        }

        if let Some(existing) = self.forward.get(virtual_id) {
            // May be a reservation whose backend write is still in flight; if
            // that write fails this caller has already seen Ok. The controller
            // queue never runs two reconciles of one virtual object at once.
            if existing.physical_identity == *physical_id {
                return Ok(existing.clone());
            }
            return Err(Error::internal_with_context(
                "mapping-store",
                format!(
                    "{virtual_id} is already mapped to {}, refusing {physical_id}",
                    existing.physical_identity
                ),
            ));
        }

        // Compare-and-set on the physical identity. The entry guard is
        // dropped before any await.
        match self.reverse.entry(physical_id.clone()) {
            Entry::Occupied(owner) => {
                if owner.get() != virtual_id {
                    return Err(Error::conflict(physical_id, owner.get(), virtual_id));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(virtual_id.clone());
            }
        }

        let mapping = Mapping::new(virtual_id.clone(), physical_id.clone());
        self.forward.insert(virtual_id.clone(), mapping.clone());

        if let Err(e) = self.backend.put(&mapping).await {
            warn!(
                virtual = %virtual_id,
                physical = %physical_id,
                error = %e,
                "failed to persist mapping, releasing reservation"
            );
            self.forward
                .remove_if(virtual_id, |_, m| m.created_at == mapping.created_at);
            self.reverse.remove_if(physical_id, |_, v| v == virtual_id);
            return Err(e);
        }

        debug!(virtual = %virtual_id, physical = %physical_id, "recorded mapping");
        Ok(mapping)
    }

    /// Remove the association for a virtual identity; absent is not an error.
    ///
    /// The backend entry goes first so a crash in between leaves the mapping
    /// recoverable rather than orphaning the physical object.
    pub async fn delete(&self, virtual_id: &ObjectIdentity) -> Result<()> {
        let Some(mapping) = self.get(virtual_id) else {
            return Ok(());
        };

        self.backend.remove(virtual_id).await?;

        self.forward.remove(virtual_id);
        self.reverse
            .remove_if(&mapping.physical_identity, |_, v| v == virtual_id);
        debug!(
            virtual = %virtual_id,
            physical = %mapping.physical_identity,
            "deleted mapping"
        );
        Ok(())
    }

    /// Every mapping of one resource kind
    pub fn mappings_for_kind(&self, kind: &ResourceKind) -> Vec<Mapping> {
        self.forward
            .iter()
            .filter(|m| &m.resource_kind == kind)
            .map(|m| m.value().clone())
            .collect()
    }

    /// Number of recorded mappings
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
