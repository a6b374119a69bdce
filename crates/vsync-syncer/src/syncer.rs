//! Sync Driver: create and update physical objects from virtual ones.
//!
//! Both directions are safe to call on every reconcile tick. A create that
//! already landed is recognised by its marker and treated as success; an
//! update computes a merge patch over owned fields and metadata and skips the
//! API call entirely when there is nothing to change.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use vsync_common::{marker, Error, ObjectIdentity, Result};
use vsync_mappings::Mapper;

use crate::client::ObjectClient;
use crate::context::SyncContext;
use crate::patch::{child_object_mut, merge_diff, object_at_mut, remove_path};
use crate::resources::SyncOptions;
use crate::translator::{GenericTranslator, MetadataUpdate, Translator};

/// Outcome of [`SyncDriver::sync_to_host_update`]
#[derive(Clone, Debug)]
pub enum UpdateResult {
    /// Physical object already matches; no write was made
    Unchanged,
    /// Physical object was patched
    Updated(DynamicObject),
}

/// Create/update contract built on a [`Translator`]
#[async_trait]
pub trait SyncDriver: Translator {
    /// Ownership options for the kind
    fn options(&self) -> &SyncOptions;

    /// The physical object a virtual object should produce
    fn desired_physical(&self, virtual_obj: &DynamicObject) -> Result<DynamicObject>;

    /// Create the physical object for `virtual_obj`.
    ///
    /// If the object already exists and belongs to the same virtual object it
    /// is returned as is; any other occupant is a `ForeignObject` error.
    async fn sync_to_host_create(
        &self,
        ctx: &SyncContext,
        virtual_obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Bring an existing physical object in line with `virtual_obj`
    async fn sync_to_host_update(
        &self,
        ctx: &SyncContext,
        virtual_obj: &DynamicObject,
        physical_obj: &DynamicObject,
    ) -> Result<UpdateResult>;

    /// Copy host status back to the virtual object; true if a write was made
    async fn sync_status_to_virtual(
        &self,
        ctx: &SyncContext,
        virtual_obj: &DynamicObject,
        physical_obj: &DynamicObject,
    ) -> Result<bool>;

    /// Delete a physical object owned by `virtual_id`, guarded by its UID.
    ///
    /// Returns false when it was already gone.
    async fn delete_from_host(
        &self,
        ctx: &SyncContext,
        virtual_id: &ObjectIdentity,
        physical_obj: &DynamicObject,
    ) -> Result<bool>;
}

/// Sync driver shared by every registered kind
pub struct GenericSyncer {
    translator: GenericTranslator,
    options: SyncOptions,
    host: Arc<dyn ObjectClient>,
    virtual_client: Arc<dyn ObjectClient>,
}

impl GenericSyncer {
    /// Driver for one kind
    pub fn new(
        translator: GenericTranslator,
        options: SyncOptions,
        host: Arc<dyn ObjectClient>,
        virtual_client: Arc<dyn ObjectClient>,
    ) -> Self {
        Self {
            translator,
            options,
            host,
            virtual_client,
        }
    }

    fn identity(&self, obj: &DynamicObject) -> Result<ObjectIdentity> {
        ObjectIdentity::from_meta(self.mapper().kind().clone(), &obj.metadata)
    }

    /// Owned fields of the virtual object, host-assigned paths removed and
    /// selectors scoped to this tenant
    fn desired_body(&self, virtual_id: &ObjectIdentity, virtual_obj: &DynamicObject) -> Value {
        let mut body = self.owned_body(virtual_obj);
        let scope = marker::marker_labels(self.translator.vcluster_name(), virtual_id);
        for path in self.options.selector_paths {
            let Some(selector) = object_at_mut(&mut body, path.selector) else {
                continue;
            };
            let labels = match path.match_labels {
                Some(key) => child_object_mut(selector, key),
                None => Some(selector),
            };
            if let Some(labels) = labels {
                for (k, v) in &scope {
                    labels.insert(k.clone(), Value::String(v.clone()));
                }
            }
        }
        body
    }

    /// Owned fields of an object with host-assigned paths removed
    fn owned_body(&self, obj: &DynamicObject) -> Value {
        let mut body = Map::new();
        for field in self.options.owned_fields {
            match obj.data.get(*field) {
                Some(value) if !value.is_null() => {
                    body.insert(field.to_string(), value.clone());
                }
                _ => {}
            }
        }
        let mut body = Value::Object(body);
        for path in self.options.excluded_paths {
            remove_path(&mut body, path);
        }
        body
    }

    fn ensure_owner(
        &self,
        virtual_id: &ObjectIdentity,
        physical_obj: &DynamicObject,
    ) -> Result<()> {
        match self.owner_of(physical_obj)? {
            Some(owner) if owner == *virtual_id => Ok(()),
            Some(owner) => Err(Error::foreign_object(
                self.identity(physical_obj)?,
                format!("owned by {owner}"),
            )),
            None => Err(Error::foreign_object(
                self.identity(physical_obj)?,
                "object exists on the host without this virtual cluster's marker",
            )),
        }
    }
}

fn string_map_json(map: &std::collections::BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

#[async_trait]
impl Translator for GenericSyncer {
    fn mapper(&self) -> &Mapper {
        self.translator.mapper()
    }

    fn owner_of(&self, physical: &DynamicObject) -> Result<Option<ObjectIdentity>> {
        self.translator.owner_of(physical)
    }

    async fn is_managed(&self, physical: &DynamicObject) -> Result<bool> {
        self.translator.is_managed(physical).await
    }

    fn translate_metadata(&self, virtual_obj: &DynamicObject) -> Result<ObjectMeta> {
        self.translator.translate_metadata(virtual_obj)
    }

    fn translate_metadata_update(
        &self,
        virtual_obj: &DynamicObject,
        physical_obj: &DynamicObject,
    ) -> Result<MetadataUpdate> {
        self.translator
            .translate_metadata_update(virtual_obj, physical_obj)
    }
}

#[async_trait]
impl SyncDriver for GenericSyncer {
    fn options(&self) -> &SyncOptions {
        &self.options
    }

    fn desired_physical(&self, virtual_obj: &DynamicObject) -> Result<DynamicObject> {
        let virtual_id = self.identity(virtual_obj)?;
        let metadata = self.translate_metadata(virtual_obj)?;
        let mut physical = DynamicObject::new(
            metadata.name.as_deref().unwrap_or_default(),
            self.mapper().api_resource(),
        );
        physical.metadata = metadata;
        physical.data = self.desired_body(&virtual_id, virtual_obj);
        Ok(physical)
    }

    async fn sync_to_host_create(
        &self,
        ctx: &SyncContext,
        virtual_obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let virtual_id = self.identity(virtual_obj)?;
        let desired = self.desired_physical(virtual_obj)?;
        let physical_id = self.identity(&desired)?;
        let ar = self.mapper().api_resource();

        ctx.check_cancelled()?;
        match self.host.create(ar, &physical_id, &desired).await {
            Ok(created) => {
                info!(virtual = %virtual_id, physical = %physical_id, "created physical object");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                let existing = self.host.get(ar, &physical_id).await?.ok_or_else(|| {
                    Error::transient_with_context(
                        "host-api",
                        format!("{physical_id} disappeared after AlreadyExists"),
                    )
                })?;
                self.ensure_owner(&virtual_id, &existing)?;
                debug!(
                    physical = %physical_id,
                    "physical object already created by an earlier attempt"
                );
                Ok(existing)
            }
            Err(e) => Err(e),
        }
    }

    async fn sync_to_host_update(
        &self,
        ctx: &SyncContext,
        virtual_obj: &DynamicObject,
        physical_obj: &DynamicObject,
    ) -> Result<UpdateResult> {
        let virtual_id = self.identity(virtual_obj)?;
        let physical_id = self.identity(physical_obj)?;
        self.ensure_owner(&virtual_id, physical_obj)?;

        let mut patch = Map::new();

        let desired = self.desired_body(&virtual_id, virtual_obj);
        let observed = self.owned_body(physical_obj);
        for field in self.options.owned_fields {
            match (desired.get(*field), observed.get(*field)) {
                (Some(d), Some(o)) => {
                    if let Some(diff) = merge_diff(o, d) {
                        patch.insert(field.to_string(), diff);
                    }
                }
                (Some(d), None) => {
                    patch.insert(field.to_string(), d.clone());
                }
                (None, Some(_)) => {
                    patch.insert(field.to_string(), Value::Null);
                }
                (None, None) => {}
            }
        }

        let metadata = self.translate_metadata_update(virtual_obj, physical_obj)?;
        let mut meta_patch = Map::new();
        if metadata.changed {
            let current_labels = physical_obj.metadata.labels.clone().unwrap_or_default();
            let current_annotations = physical_obj
                .metadata
                .annotations
                .clone()
                .unwrap_or_default();
            if let Some(diff) = merge_diff(
                &string_map_json(&current_labels),
                &string_map_json(&metadata.labels),
            ) {
                meta_patch.insert("labels".into(), diff);
            }
            if let Some(diff) = merge_diff(
                &string_map_json(&current_annotations),
                &string_map_json(&metadata.annotations),
            ) {
                meta_patch.insert("annotations".into(), diff);
            }
        }

        if patch.is_empty() && meta_patch.is_empty() {
            debug!(physical = %physical_id, "physical object up to date");
            return Ok(UpdateResult::Unchanged);
        }

        meta_patch.insert(
            "resourceVersion".into(),
            json!(physical_obj.metadata.resource_version),
        );
        patch.insert("metadata".into(), Value::Object(meta_patch));

        ctx.check_cancelled()?;
        let updated = self
            .host
            .patch(self.mapper().api_resource(), &physical_id, &Value::Object(patch))
            .await?;
        info!(virtual = %virtual_id, physical = %physical_id, "updated physical object");
        Ok(UpdateResult::Updated(updated))
    }

    async fn sync_status_to_virtual(
        &self,
        ctx: &SyncContext,
        virtual_obj: &DynamicObject,
        physical_obj: &DynamicObject,
    ) -> Result<bool> {
        if !self.options.propagate_status {
            return Ok(false);
        }
        let Some(host_status) = physical_obj.data.get("status") else {
            return Ok(false);
        };
        let virtual_status = virtual_obj
            .data
            .get("status")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let Some(diff) = merge_diff(&virtual_status, host_status) else {
            return Ok(false);
        };

        let virtual_id = self.identity(virtual_obj)?;
        ctx.check_cancelled()?;
        self.virtual_client
            .patch_status(
                self.mapper().api_resource(),
                &virtual_id,
                &json!({ "status": diff }),
            )
            .await?;
        debug!(virtual = %virtual_id, "propagated host status");
        Ok(true)
    }

    async fn delete_from_host(
        &self,
        ctx: &SyncContext,
        virtual_id: &ObjectIdentity,
        physical_obj: &DynamicObject,
    ) -> Result<bool> {
        self.ensure_owner(virtual_id, physical_obj)?;
        let physical_id = self.identity(physical_obj)?;

        ctx.check_cancelled()?;
        let deleted = self
            .host
            .delete(
                self.mapper().api_resource(),
                &physical_id,
                physical_obj.metadata.uid.as_deref(),
            )
            .await?;
        if deleted {
            info!(virtual = %virtual_id, physical = %physical_id, "deleted physical object");
        }
        Ok(deleted)
    }
}
