//! Translator: metadata reconciliation and ownership detection.
//!
//! Physical metadata is the ManagedMarker plus the virtual object's own
//! labels and annotations minus reserved keys. The keys copied on the last
//! write are recorded in the managed-labels / managed-annotations
//! annotations; only those keys are ever removed from the host, so metadata
//! added by host-side controllers survives.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use vsync_common::marker::{
    self, ANNOTATION_MANAGED_ANNOTATIONS, ANNOTATION_MANAGED_LABELS,
};
use vsync_common::{ObjectIdentity, Result};
use vsync_mappings::{Mapper, MappingStore};

use crate::client::ObjectClient;

/// Result of comparing a physical object's metadata with the desired overlay
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataUpdate {
    /// Whether labels or annotations differ from what the physical object has
    pub changed: bool,
    /// Annotations the physical object should carry
    pub annotations: BTreeMap<String, String>,
    /// Labels the physical object should carry
    pub labels: BTreeMap<String, String>,
}

/// Per-kind metadata translation and ownership contract
#[async_trait]
pub trait Translator: Send + Sync {
    /// Identity mapper for this kind
    fn mapper(&self) -> &Mapper;

    /// Virtual identity owning a physical object, if the object carries this
    /// engine's marker and the reverse mapping resolves
    fn owner_of(&self, physical: &DynamicObject) -> Result<Option<ObjectIdentity>>;

    /// True iff the physical object is marked as ours and its reverse-mapped
    /// virtual object still exists
    async fn is_managed(&self, physical: &DynamicObject) -> Result<bool>;

    /// Physical metadata (identity, labels, annotations) for a virtual object
    fn translate_metadata(&self, virtual_obj: &DynamicObject) -> Result<ObjectMeta>;

    /// Desired labels and annotations for an existing physical object.
    ///
    /// Idempotent: applying the result and re-evaluating yields `changed = false`.
    fn translate_metadata_update(
        &self,
        virtual_obj: &DynamicObject,
        physical_obj: &DynamicObject,
    ) -> Result<MetadataUpdate>;
}

/// Translator shared by every registered kind
pub struct GenericTranslator {
    vcluster_name: String,
    mapper: Arc<Mapper>,
    store: Arc<MappingStore>,
    virtual_client: Arc<dyn ObjectClient>,
    denied_annotations: &'static [&'static str],
}

impl GenericTranslator {
    /// Translator for one kind of one virtual cluster
    pub fn new(
        vcluster_name: impl Into<String>,
        mapper: Arc<Mapper>,
        store: Arc<MappingStore>,
        virtual_client: Arc<dyn ObjectClient>,
    ) -> Self {
        Self {
            vcluster_name: vcluster_name.into(),
            mapper,
            store,
            virtual_client,
            denied_annotations: &[],
        }
    }

    /// Never copy these virtual annotations to the host
    pub fn with_denied_annotations(mut self, keys: &'static [&'static str]) -> Self {
        self.denied_annotations = keys;
        self
    }

    /// Name of the virtual cluster this translator marks objects for
    pub fn vcluster_name(&self) -> &str {
        &self.vcluster_name
    }

    fn virtual_identity(&self, virtual_obj: &DynamicObject) -> Result<ObjectIdentity> {
        ObjectIdentity::from_meta(self.mapper.kind().clone(), &virtual_obj.metadata)
    }

    /// Copyable (labels, annotations) of the virtual object
    fn copied_metadata(
        &self,
        virtual_obj: &DynamicObject,
    ) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let copy = |m: &Option<BTreeMap<String, String>>, denied: &[&str]| {
            m.iter()
                .flatten()
                .filter(|(k, _)| marker::is_copyable_key(k) && !denied.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<String, String>>()
        };
        (
            copy(&virtual_obj.metadata.labels, &[]),
            copy(&virtual_obj.metadata.annotations, self.denied_annotations),
        )
    }

    /// Full desired (labels, annotations), marker and bookkeeping included
    fn desired_metadata(
        &self,
        virtual_id: &ObjectIdentity,
        virtual_obj: &DynamicObject,
    ) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let (copied_labels, copied_annotations) = self.copied_metadata(virtual_obj);

        let mut annotations = copied_annotations.clone();
        annotations.insert(
            ANNOTATION_MANAGED_LABELS.to_string(),
            marker::render_managed_keys(copied_labels.keys()),
        );
        annotations.insert(
            ANNOTATION_MANAGED_ANNOTATIONS.to_string(),
            marker::render_managed_keys(copied_annotations.keys()),
        );
        annotations.extend(marker::marker_annotations(virtual_id));

        let mut labels = copied_labels;
        labels.extend(marker::marker_labels(&self.vcluster_name, virtual_id));

        (labels, annotations)
    }
}

/// Drop previously managed keys that are no longer desired, then overlay the desired set
fn merge_managed(
    current: &BTreeMap<String, String>,
    previously_managed: &[String],
    desired: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let previously_managed: BTreeSet<&String> = previously_managed.iter().collect();
    let mut merged: BTreeMap<String, String> = current
        .iter()
        .filter(|(k, _)| !previously_managed.contains(k) || desired.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    merged.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

#[async_trait]
impl Translator for GenericTranslator {
    fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    fn owner_of(&self, physical: &DynamicObject) -> Result<Option<ObjectIdentity>> {
        if !marker::has_marker(physical.metadata.labels.as_ref(), &self.vcluster_name) {
            return Ok(None);
        }
        let physical_id =
            ObjectIdentity::from_meta(self.mapper.kind().clone(), &physical.metadata)?;
        match self.mapper.virtual_identity(&physical_id, &self.store) {
            Ok(virtual_id) => Ok(Some(virtual_id)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn is_managed(&self, physical: &DynamicObject) -> Result<bool> {
        let Some(virtual_id) = self.owner_of(physical)? else {
            return Ok(false);
        };
        Ok(self
            .virtual_client
            .get(self.mapper.api_resource(), &virtual_id)
            .await?
            .is_some())
    }

    fn translate_metadata(&self, virtual_obj: &DynamicObject) -> Result<ObjectMeta> {
        let virtual_id = self.virtual_identity(virtual_obj)?;
        let physical_id = self.mapper.physical_identity(&virtual_id)?;
        let (labels, annotations) = self.desired_metadata(&virtual_id, virtual_obj);

        Ok(ObjectMeta {
            name: Some(physical_id.name),
            namespace: physical_id.namespace,
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        })
    }

    fn translate_metadata_update(
        &self,
        virtual_obj: &DynamicObject,
        physical_obj: &DynamicObject,
    ) -> Result<MetadataUpdate> {
        let virtual_id = self.virtual_identity(virtual_obj)?;
        let (desired_labels, desired_annotations) =
            self.desired_metadata(&virtual_id, virtual_obj);

        let current_labels = physical_obj.metadata.labels.clone().unwrap_or_default();
        let current_annotations = physical_obj
            .metadata
            .annotations
            .clone()
            .unwrap_or_default();

        let managed_labels =
            marker::parse_managed_keys(current_annotations.get(ANNOTATION_MANAGED_LABELS));
        let managed_annotations =
            marker::parse_managed_keys(current_annotations.get(ANNOTATION_MANAGED_ANNOTATIONS));

        let labels = merge_managed(&current_labels, &managed_labels, &desired_labels);
        let annotations =
            merge_managed(&current_annotations, &managed_annotations, &desired_annotations);

        Ok(MetadataUpdate {
            changed: labels != current_labels || annotations != current_annotations,
            annotations,
            labels,
        })
    }
}
