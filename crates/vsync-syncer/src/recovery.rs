//! Startup recovery of the Mapping Store from host annotations.
//!
//! Every physical object the engine creates names its virtual owner in
//! annotations. If the persisted store was lost or is behind, those objects
//! would look foreign; re-recording them before controllers start keeps them
//! owned.

use kube::api::DynamicObject;
use tracing::{debug, info, warn};
use vsync_common::{marker, ObjectIdentity, Result};
use vsync_mappings::{Mapper, MapperRegistry, MappingStore};

use crate::client::ObjectClient;

/// Counts from one recovery pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Mappings re-recorded from annotations
    pub recovered: usize,
    /// Objects whose mapping was already present
    pub already_mapped: usize,
    /// Objects skipped: missing or inconsistent owner annotations, or a
    /// conflicting mapping
    pub skipped: usize,
}

/// Re-record mappings for every managed host object of every registered kind.
///
/// `target_namespace` is where namespaced kinds live on the host.
pub async fn recover_mappings(
    vcluster_name: &str,
    target_namespace: &str,
    registry: &MapperRegistry,
    store: &MappingStore,
    host: &dyn ObjectClient,
) -> Result<RecoveryReport> {
    let selector = marker::managed_selector(vcluster_name);
    let mut report = RecoveryReport::default();

    for mapper in registry.mappers() {
        let namespace = mapper.is_namespaced().then_some(target_namespace);
        let objects = host.list(mapper.api_resource(), namespace, &selector).await?;
        debug!(kind = %mapper.kind(), count = objects.len(), "scanning managed host objects");

        for obj in &objects {
            recover_one(mapper, store, obj, &mut report).await?;
        }
    }

    info!(
        recovered = report.recovered,
        already_mapped = report.already_mapped,
        skipped = report.skipped,
        "mapping recovery complete"
    );
    Ok(report)
}

async fn recover_one(
    mapper: &Mapper,
    store: &MappingStore,
    obj: &DynamicObject,
    report: &mut RecoveryReport,
) -> Result<()> {
    let kind = mapper.kind();
    let Ok(physical_id) = ObjectIdentity::from_meta(kind.clone(), &obj.metadata) else {
        report.skipped += 1;
        return Ok(());
    };

    if store.reverse_lookup(&physical_id).is_ok() {
        report.already_mapped += 1;
        return Ok(());
    }

    let Some(owner) = marker::owner_from_annotations(kind, obj.metadata.annotations.as_ref())
    else {
        warn!(physical = %physical_id, "managed host object has no owner annotations");
        report.skipped += 1;
        return Ok(());
    };

    // Annotations are only trusted when they derive the object's own identity
    match mapper.physical_identity(&owner) {
        Ok(expected) if expected == physical_id => {}
        _ => {
            warn!(
                physical = %physical_id,
                virtual = %owner,
                "owner annotations do not derive this host object; skipping"
            );
            report.skipped += 1;
            return Ok(());
        }
    }

    if let Ok(existing) = store.lookup(&owner) {
        warn!(
            virtual = %owner,
            physical = %physical_id,
            mapped = %existing,
            "virtual object already mapped elsewhere; skipping"
        );
        report.skipped += 1;
        return Ok(());
    }

    match store.record(&owner, &physical_id).await {
        Ok(_) => {
            info!(virtual = %owner, physical = %physical_id, "recovered mapping");
            report.recovered += 1;
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            warn!(error = %e, "conflict during recovery; skipping");
            report.skipped += 1;
            Ok(())
        }
        Err(e) => Err(e),
    }
}
