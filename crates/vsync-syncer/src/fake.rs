//! In-memory cluster implementing [`ObjectClient`] for tests.
//!
//! Behaves like the API server where the engine depends on it: 409
//! AlreadyExists on create, optimistic concurrency on `metadata.resourceVersion`,
//! UID preconditions on delete, and finalizers holding back deletion.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ApiResource, DynamicObject};
use kube::core::ErrorResponse;
use vsync_common::{Error, ObjectIdentity, ResourceKind, Result};

use crate::client::ObjectClient;
use crate::patch::apply_merge_patch;

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube {
        source: kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message,
            reason: reason.to_string(),
            code,
        }),
    }
}

#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectIdentity, DynamicObject>>,
    next_version: AtomicU64,
    creates: AtomicUsize,
    patches: AtomicUsize,
    status_patches: AtomicUsize,
    deletes: AtomicUsize,
    unavailable: AtomicBool,
    stalled: AtomicBool,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing counters. Assigns uid and version.
    pub fn insert(&self, kind: &ResourceKind, mut obj: DynamicObject) -> DynamicObject {
        let id = ObjectIdentity::from_meta(kind.clone(), &obj.metadata).unwrap();
        let version = self.bump();
        obj.metadata.uid.get_or_insert_with(|| format!("uid-{version}"));
        obj.metadata.resource_version = Some(version.to_string());
        self.objects.lock().unwrap().insert(id, obj.clone());
        obj
    }

    pub fn object(&self, id: &ObjectIdentity) -> Option<DynamicObject> {
        self.objects.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn patches(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    pub fn status_patches(&self) -> usize {
        self.status_patches.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Make every write fail with 503 until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every call hang without answering until reset
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn wait_if_stalled(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(api_error(503, "ServiceUnavailable", "injected outage".into()));
        }
        Ok(())
    }

    fn not_found(id: &ObjectIdentity) -> Error {
        api_error(404, "NotFound", format!("{id} not found"))
    }

    fn apply(
        &self,
        id: &ObjectIdentity,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let mut objects = self.objects.lock().unwrap();
        let current = objects.get(id).ok_or_else(|| Self::not_found(id))?;

        if let Some(rv) = patch.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()) {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Err(api_error(409, "Conflict", format!("{id} was modified")));
            }
        }

        let mut value = serde_json::to_value(current).unwrap();
        apply_merge_patch(&mut value, patch);
        let mut updated: DynamicObject = serde_json::from_value(value).unwrap();
        updated.metadata.resource_version = Some(self.bump().to_string());

        let finalizers_done = updated
            .metadata
            .finalizers
            .as_ref()
            .is_none_or(|f| f.is_empty());
        if updated.metadata.deletion_timestamp.is_some() && finalizers_done {
            objects.remove(id);
        } else {
            objects.insert(id.clone(), updated.clone());
        }
        Ok(updated)
    }
}

fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ObjectClient for FakeCluster {
    async fn get(&self, _ar: &ApiResource, id: &ObjectIdentity) -> Result<Option<DynamicObject>> {
        self.wait_if_stalled().await;
        Ok(self.object(id))
    }

    async fn create(
        &self,
        _ar: &ApiResource,
        id: &ObjectIdentity,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        self.wait_if_stalled().await;
        self.check_available()?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.objects.lock().unwrap().contains_key(id) {
            return Err(api_error(409, "AlreadyExists", format!("{id} already exists")));
        }
        let mut obj = obj.clone();
        obj.metadata.uid = None;
        Ok(self.insert(&id.kind, obj))
    }

    async fn patch(
        &self,
        _ar: &ApiResource,
        id: &ObjectIdentity,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        self.wait_if_stalled().await;
        self.check_available()?;
        self.patches.fetch_add(1, Ordering::SeqCst);
        self.apply(id, patch)
    }

    async fn patch_status(
        &self,
        _ar: &ApiResource,
        id: &ObjectIdentity,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.wait_if_stalled().await;
        self.check_available()?;
        self.status_patches.fetch_add(1, Ordering::SeqCst);
        let status_only = serde_json::json!({ "status": patch.get("status").cloned() });
        self.apply(id, &status_only).map(|_| ())
    }

    async fn delete(
        &self,
        _ar: &ApiResource,
        id: &ObjectIdentity,
        uid: Option<&str>,
    ) -> Result<bool> {
        self.wait_if_stalled().await;
        self.check_available()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get_mut(id) else {
            return Ok(false);
        };
        if let Some(uid) = uid {
            if current.metadata.uid.as_deref() != Some(uid) {
                return Err(api_error(409, "Conflict", format!("{id} uid precondition failed")));
            }
        }
        let has_finalizers = current
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            current
                .metadata
                .deletion_timestamp
                .get_or_insert_with(|| Time(k8s_openapi::chrono::Utc::now()));
        } else {
            objects.remove(id);
        }
        Ok(true)
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let kind = ResourceKind::from_api_resource(ar);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.kind == kind)
            .filter(|(id, _)| namespace.is_none() || id.namespace.as_deref() == namespace)
            .filter(|(_, obj)| matches_selector(obj, label_selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}
