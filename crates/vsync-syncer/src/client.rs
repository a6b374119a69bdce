//! Object client seam over one cluster.
//!
//! The syncer talks to two clusters (virtual and host) about many kinds, so
//! every call takes the kind's [`ApiResource`] and works on `DynamicObject`s.
//! Reconcilers only see the [`ObjectClient`] trait; tests swap in an
//! in-memory cluster.

use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    Preconditions,
};
use kube::Client;
use tracing::debug;
use vsync_common::{ObjectIdentity, Result, FIELD_MANAGER};

/// Operations the engine performs against a cluster
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Fetch an object, `None` if it does not exist
    async fn get(&self, ar: &ApiResource, id: &ObjectIdentity) -> Result<Option<DynamicObject>>;

    /// Create an object at `id`
    async fn create(
        &self,
        ar: &ApiResource,
        id: &ObjectIdentity,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to an object
    async fn patch(
        &self,
        ar: &ApiResource,
        id: &ObjectIdentity,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to an object's status subresource
    async fn patch_status(
        &self,
        ar: &ApiResource,
        id: &ObjectIdentity,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// Delete an object, only if its UID still matches `uid` when given.
    ///
    /// Returns `false` when the object was already gone.
    async fn delete(&self, ar: &ApiResource, id: &ObjectIdentity, uid: Option<&str>)
        -> Result<bool>;

    /// List objects matching a label selector, in one namespace or cluster-wide
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>>;
}

/// Real implementation backed by a kube client
#[derive(Clone)]
pub struct KubeObjectClient {
    client: Client,
}

impl KubeObjectClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn get(&self, ar: &ApiResource, id: &ObjectIdentity) -> Result<Option<DynamicObject>> {
        Ok(self
            .api(ar, id.namespace.as_deref())
            .get_opt(&id.name)
            .await?)
    }

    async fn create(
        &self,
        ar: &ApiResource,
        id: &ObjectIdentity,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let created = self.api(ar, id.namespace.as_deref()).create(&pp, obj).await?;
        debug!(object = %id, "created");
        Ok(created)
    }

    async fn patch(
        &self,
        ar: &ApiResource,
        id: &ObjectIdentity,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(ar, id.namespace.as_deref())
            .patch(&id.name, &Self::patch_params(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        id: &ObjectIdentity,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.api(ar, id.namespace.as_deref())
            .patch_status(&id.name, &Self::patch_params(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        ar: &ApiResource,
        id: &ObjectIdentity,
        uid: Option<&str>,
    ) -> Result<bool> {
        let dp = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..Default::default()
        };
        match self.api(ar, id.namespace.as_deref()).delete(&id.name, &dp).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api(ar, namespace).list(&lp).await?.items)
    }
}
