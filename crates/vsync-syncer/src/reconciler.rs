//! Reconciler state machine.
//!
//! Virtual side: `Unsynced -> Synced -> Updating -> (Synced | Error) -> Deleting -> Gone`.
//! Each call recomputes from current state, so a reconcile that was
//! cancelled half way is simply picked up by the next one.
//!
//! Physical side: managed host objects whose virtual owner is gone are
//! garbage collected.

use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use vsync_common::events::{actions, reasons};
use vsync_common::{
    marker, Error, ObjectIdentity, Result, HOST_CLEANUP_FINALIZER, REQUEUE_DELETING_SECS,
    REQUEUE_FOREIGN_SECS,
};

use crate::context::{Context, SyncContext};
use crate::syncer::UpdateResult;

/// Lifecycle state of a virtual object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// No mapping recorded yet
    Unsynced,
    /// Physical object matches the virtual object
    Synced,
    /// A diff was found and is being applied
    Updating,
    /// Last reconcile failed; retried with backoff
    Error,
    /// Virtual object is being deleted, host cleanup in progress
    Deleting,
    /// Host cleanup done and finalizer released
    Gone,
}

fn has_cleanup_finalizer(obj: &DynamicObject) -> bool {
    obj.finalizers().iter().any(|f| f == HOST_CLEANUP_FINALIZER)
}

fn finalizers_patch(obj: &DynamicObject, finalizers: Vec<String>) -> Value {
    json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.metadata.resource_version,
        }
    })
}

/// Reconcile one virtual object.
#[instrument(skip(obj, ctx), fields(kind = %ctx.driver.mapper().kind(), object = %obj.name_any()))]
pub async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action> {
    let mapper = ctx.driver.mapper();
    let virtual_id = ObjectIdentity::from_meta(mapper.kind().clone(), &obj.metadata)?;

    let cancel = ctx.shutdown.child_token();
    let mut sync_ctx = SyncContext::new(
        obj.object_ref(mapper.api_resource()),
        ctx.events.clone(),
        cancel.clone(),
    );

    let timeout = ctx.settings.timeout;
    let result = match tokio::time::timeout(
        timeout,
        reconcile_virtual(&obj, &virtual_id, &mut sync_ctx, &ctx),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(Error::transient_with_context(
                "reconcile",
                format!("timed out after {timeout:?}"),
            ))
        }
    };

    match result {
        Ok((state, action)) => {
            ctx.backoff.reset(&virtual_id);
            debug!(virtual = %virtual_id, ?state, "reconciled");
            Ok(action)
        }
        Err(e) => {
            handle_failure(&ctx, &sync_ctx, &virtual_id, &e).await;
            Err(e)
        }
    }
}

async fn reconcile_virtual(
    obj: &DynamicObject,
    virtual_id: &ObjectIdentity,
    sync_ctx: &mut SyncContext,
    ctx: &Context,
) -> Result<(SyncState, Action)> {
    if obj.metadata.deletion_timestamp.is_some() {
        return finalize(obj, virtual_id, sync_ctx, ctx).await;
    }

    let driver = &ctx.driver;
    let ar = driver.mapper().api_resource();

    // Deletion must be observable before anything lands on the host
    ensure_finalizer(obj, virtual_id, sync_ctx, ctx).await?;

    let (from, physical_id) = match ctx.store.lookup(virtual_id) {
        Ok(physical_id) => (SyncState::Synced, physical_id),
        Err(e) if e.is_not_found() => {
            let physical_id = driver.mapper().physical_identity(virtual_id)?;
            sync_ctx.check_cancelled()?;
            ctx.store.record(virtual_id, &physical_id).await?;
            info!(virtual = %virtual_id, physical = %physical_id, "recorded mapping");
            (SyncState::Unsynced, physical_id)
        }
        Err(e) => return Err(e),
    };
    sync_ctx.mapping = ctx.store.get(virtual_id);

    let physical = match ctx.host_client.get(ar, &physical_id).await? {
        None => {
            let created = driver.sync_to_host_create(sync_ctx, obj).await?;
            sync_ctx
                .normal(
                    reasons::SYNCED_TO_HOST,
                    actions::CREATE,
                    format!("Created {physical_id}"),
                )
                .await;
            debug!(virtual = %virtual_id, ?from, to = ?SyncState::Synced, "state transition");
            created
        }
        Some(physical) if physical.metadata.deletion_timestamp.is_some() => {
            debug!(physical = %physical_id, "host object is terminating; waiting before re-create");
            return Ok((
                SyncState::Updating,
                Action::requeue(Duration::from_secs(REQUEUE_DELETING_SECS)),
            ));
        }
        Some(physical) => match driver.sync_to_host_update(sync_ctx, obj, &physical).await? {
            UpdateResult::Unchanged => physical,
            UpdateResult::Updated(updated) => {
                sync_ctx
                    .normal(
                        reasons::UPDATED_ON_HOST,
                        actions::UPDATE,
                        format!("Updated {physical_id}"),
                    )
                    .await;
                debug!(
                    virtual = %virtual_id,
                    from = ?SyncState::Updating,
                    to = ?SyncState::Synced,
                    "state transition"
                );
                updated
            }
        },
    };

    driver.sync_status_to_virtual(sync_ctx, obj, &physical).await?;

    Ok((
        SyncState::Synced,
        Action::requeue(ctx.settings.resync_interval),
    ))
}

async fn ensure_finalizer(
    obj: &DynamicObject,
    virtual_id: &ObjectIdentity,
    sync_ctx: &SyncContext,
    ctx: &Context,
) -> Result<()> {
    if has_cleanup_finalizer(obj) {
        return Ok(());
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(HOST_CLEANUP_FINALIZER.to_string());

    sync_ctx.check_cancelled()?;
    ctx.virtual_client
        .patch(
            ctx.driver.mapper().api_resource(),
            virtual_id,
            &finalizers_patch(obj, finalizers),
        )
        .await?;
    debug!(virtual = %virtual_id, "added host cleanup finalizer");
    Ok(())
}

async fn remove_finalizer(
    obj: &DynamicObject,
    virtual_id: &ObjectIdentity,
    sync_ctx: &SyncContext,
    ctx: &Context,
) -> Result<()> {
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != HOST_CLEANUP_FINALIZER)
        .cloned()
        .collect();

    sync_ctx.check_cancelled()?;
    match ctx
        .virtual_client
        .patch(
            ctx.driver.mapper().api_resource(),
            virtual_id,
            &finalizers_patch(obj, finalizers),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// `Deleting -> Gone`: remove the physical object, then the mapping, then the
/// finalizer. The mapping outlives the host object so a crash in between
/// never orphans it.
async fn finalize(
    obj: &DynamicObject,
    virtual_id: &ObjectIdentity,
    sync_ctx: &mut SyncContext,
    ctx: &Context,
) -> Result<(SyncState, Action)> {
    if !has_cleanup_finalizer(obj) {
        return Ok((SyncState::Gone, Action::await_change()));
    }

    let driver = &ctx.driver;
    let ar = driver.mapper().api_resource();

    if let Some(mapping) = ctx.store.get(virtual_id) {
        let physical_id = mapping.physical_identity.clone();
        sync_ctx.mapping = Some(mapping);

        if let Some(physical) = ctx.host_client.get(ar, &physical_id).await? {
            match driver.owner_of(&physical)? {
                Some(owner) if owner == *virtual_id => {
                    if physical.metadata.deletion_timestamp.is_none()
                        && driver.delete_from_host(sync_ctx, virtual_id, &physical).await?
                    {
                        sync_ctx
                            .normal(
                                reasons::DELETED_FROM_HOST,
                                actions::DELETE,
                                format!("Deleted {physical_id}"),
                            )
                            .await;
                    }
                    if ctx.host_client.get(ar, &physical_id).await?.is_some() {
                        debug!(physical = %physical_id, "waiting for host object to go away");
                        return Ok((
                            SyncState::Deleting,
                            Action::requeue(Duration::from_secs(REQUEUE_DELETING_SECS)),
                        ));
                    }
                }
                _ => {
                    warn!(
                        virtual = %virtual_id,
                        physical = %physical_id,
                        "host object at mapped identity is not ours; leaving it in place"
                    );
                }
            }
        }

        sync_ctx.check_cancelled()?;
        ctx.store.delete(virtual_id).await?;
        info!(virtual = %virtual_id, physical = %physical_id, "removed mapping");
    } else {
        debug!(virtual = %virtual_id, "never materialized on the host");
    }

    remove_finalizer(obj, virtual_id, sync_ctx, ctx).await?;
    debug!(
        virtual = %virtual_id,
        from = ?SyncState::Deleting,
        to = ?SyncState::Gone,
        "state transition"
    );
    Ok((SyncState::Gone, Action::await_change()))
}

/// Record the failure for backoff and surface it on the virtual object
async fn handle_failure(
    ctx: &Context,
    sync_ctx: &SyncContext,
    virtual_id: &ObjectIdentity,
    error: &Error,
) {
    let note = error.to_string();
    match error {
        Error::Conflict { .. } => {
            let (attempts, delay) = ctx.backoff.record_failure(virtual_id.clone());
            warn!(
                virtual = %virtual_id,
                attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "mapping conflict"
            );
            if attempts == ctx.settings.conflict_warning_threshold {
                sync_ctx
                    .warning(error.reason(), actions::RECONCILE, note)
                    .await;
            }
        }
        Error::ForeignObject { .. } => {
            warn!(virtual = %virtual_id, error = %error, "refusing to touch foreign host object");
            sync_ctx
                .warning(error.reason(), actions::RECONCILE, note)
                .await;
        }
        e if !e.is_retryable() => {
            warn!(
                virtual = %virtual_id,
                error = %error,
                "sync failed; waiting for the object to change"
            );
            sync_ctx
                .warning(error.reason(), actions::RECONCILE, note)
                .await;
        }
        _ => {
            let (attempts, delay) = ctx.backoff.record_failure(virtual_id.clone());
            warn!(
                virtual = %virtual_id,
                state = ?SyncState::Error,
                attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "sync failed, will retry"
            );
            if attempts == 1 {
                sync_ctx
                    .warning(reasons::SYNC_FAILED, actions::RECONCILE, note)
                    .await;
            }
        }
    }
}

fn requeue_for(error: &Error, backoff_key: Option<&ObjectIdentity>, ctx: &Context) -> Action {
    match error {
        Error::ForeignObject { .. } => {
            Action::requeue(Duration::from_secs(REQUEUE_FOREIGN_SECS))
        }
        e if !e.is_retryable() => Action::await_change(),
        _ => match backoff_key {
            Some(key) => Action::requeue(ctx.backoff.next_delay(key)),
            None => Action::requeue(ctx.settings.backoff.base),
        },
    }
}

/// Error policy for the virtual-side controller
pub fn error_policy(obj: Arc<DynamicObject>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = ObjectIdentity::from_meta(ctx.driver.mapper().kind().clone(), &obj.metadata).ok();
    requeue_for(error, key.as_ref(), &ctx)
}

/// Reconcile one managed physical object, collecting it if its owner is gone.
#[instrument(skip(obj, ctx), fields(kind = %ctx.driver.mapper().kind(), object = %obj.name_any()))]
pub async fn reconcile_physical(obj: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action> {
    let kind = ctx.driver.mapper().kind().clone();
    let physical_id = ObjectIdentity::from_meta(kind.clone(), &obj.metadata)?;

    let result = collect_if_orphaned(&obj, &physical_id, &ctx).await;
    match &result {
        Ok(_) => ctx.backoff.reset(&physical_id),
        Err(e) if e.is_retryable() => {
            let (attempts, _) = ctx.backoff.record_failure(physical_id.clone());
            warn!(physical = %physical_id, attempts, error = %e, "orphan check failed, will retry");
        }
        Err(e) => warn!(physical = %physical_id, error = %e, "orphan check failed"),
    }
    result
}

async fn collect_if_orphaned(
    obj: &DynamicObject,
    physical_id: &ObjectIdentity,
    ctx: &Context,
) -> Result<Action> {
    if !marker::has_marker(obj.metadata.labels.as_ref(), &ctx.vcluster_name) {
        return Ok(Action::await_change());
    }
    if obj.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let driver = &ctx.driver;
    let mapper = driver.mapper();
    let ar = mapper.api_resource();

    let owner = match driver.owner_of(obj)? {
        Some(owner) => Some(owner),
        None => marker::owner_from_annotations(mapper.kind(), obj.metadata.annotations.as_ref()),
    };
    let Some(virtual_id) = owner else {
        warn!(
            physical = %physical_id,
            "managed host object names no virtual owner; leaving it in place"
        );
        return Ok(Action::await_change());
    };

    let virtual_exists = ctx.virtual_client.get(ar, &virtual_id).await?.is_some();
    let mapped_here = match ctx.store.lookup(&virtual_id) {
        Ok(mapped) => mapped == *physical_id,
        Err(e) if e.is_not_found() => true,
        Err(e) => return Err(e),
    };
    if virtual_exists && mapped_here {
        return Ok(Action::requeue(ctx.settings.resync_interval));
    }

    if ctx.shutdown.is_cancelled() {
        return Err(Error::transient_with_context("reconcile", "cancelled"));
    }
    ctx.host_client
        .delete(ar, physical_id, obj.metadata.uid.as_deref())
        .await?;
    info!(
        physical = %physical_id,
        virtual = %virtual_id,
        "garbage collected orphaned host object"
    );

    if !virtual_exists && ctx.store.reverse_lookup(physical_id).ok().as_ref() == Some(&virtual_id) {
        ctx.store.delete(&virtual_id).await?;
        info!(virtual = %virtual_id, "removed mapping of deleted virtual object");
    }
    Ok(Action::await_change())
}

/// Error policy for the physical-side controller
pub fn error_policy_physical(obj: Arc<DynamicObject>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = ObjectIdentity::from_meta(ctx.driver.mapper().kind().clone(), &obj.metadata).ok();
    requeue_for(error, key.as_ref(), &ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ObjectClient;
    use crate::context::ReconcileSettings;
    use crate::fake::FakeCluster;
    use crate::resources::{sync_options, DEFAULT_INGRESS_CLASS_ANNOTATION};
    use crate::syncer::GenericSyncer;
    use crate::translator::GenericTranslator;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Service};
    use k8s_openapi::api::networking::v1::IngressClass;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ApiResource;
    use kube::runtime::events::EventType;
    use mockall::mock;
    use vsync_common::events::EventPublisher;
    use vsync_common::retry::Backoff;
    use vsync_common::ResourceKind;
    use vsync_mappings::{
        HashedNameTranslator, Mapper, MappingStore, MemoryBackend, NameTranslator, SyncedKind,
    };

    // Local mock: the automock generated in vsync-common is only compiled for
    // that crate's own tests
    mock! {
        pub Events {}

        #[async_trait]
        impl EventPublisher for Events {
            async fn publish(
                &self,
                resource_ref: &ObjectReference,
                type_: EventType,
                reason: &str,
                action: &str,
                note: Option<String>,
            );
        }
    }

    /// Maps every virtual object onto the same host name
    struct Colliding;

    impl NameTranslator for Colliding {
        fn physical_name(&self, _name: &str, _namespace: &str) -> String {
            "collide".to_string()
        }

        fn physical_namespace(&self, _namespace: &str) -> String {
            "host-ns".to_string()
        }
    }

    struct Harness {
        ctx: Arc<Context>,
        store: Arc<MappingStore>,
        host: Arc<FakeCluster>,
        virtual_cluster: Arc<FakeCluster>,
        ar: ApiResource,
        kind: ResourceKind,
    }

    struct HarnessBuilder {
        ar: ApiResource,
        synced: SyncedKind,
        mirror: bool,
        translator: Arc<dyn NameTranslator>,
        events: Option<Arc<dyn EventPublisher>>,
        settings: ReconcileSettings,
    }

    impl HarnessBuilder {
        fn config_maps() -> Self {
            Self {
                ar: ApiResource::erase::<ConfigMap>(&()),
                synced: SyncedKind::ConfigMaps,
                mirror: false,
                translator: Arc::new(HashedNameTranslator::new("tenant-1", "host-ns")),
                events: None,
                settings: ReconcileSettings {
                    backoff: Backoff {
                        base: Duration::from_millis(10),
                        max: Duration::from_secs(1),
                    },
                    ..Default::default()
                },
            }
        }

        fn services() -> Self {
            Self {
                ar: ApiResource::erase::<Service>(&()),
                synced: SyncedKind::Services,
                ..Self::config_maps()
            }
        }

        fn ingress_classes() -> Self {
            Self {
                ar: ApiResource::erase::<IngressClass>(&()),
                synced: SyncedKind::IngressClasses,
                mirror: true,
                ..Self::config_maps()
            }
        }

        fn translator(mut self, translator: Arc<dyn NameTranslator>) -> Self {
            self.translator = translator;
            self
        }

        fn events(mut self, events: MockEvents) -> Self {
            self.events = Some(Arc::new(events));
            self
        }

        fn conflict_threshold(mut self, threshold: u32) -> Self {
            self.settings.conflict_warning_threshold = threshold;
            self
        }

        fn timeout(mut self, timeout: Duration) -> Self {
            self.settings.timeout = timeout;
            self
        }

        async fn build(self) -> Harness {
            let mapper = if self.mirror {
                Mapper::mirror(self.ar.clone())
            } else {
                Mapper::namespaced(self.ar.clone(), self.translator)
            };
            let mapper = Arc::new(mapper);
            let options = sync_options(self.synced);
            let kind = mapper.kind().clone();
            let store = Arc::new(
                MappingStore::open(Arc::new(MemoryBackend::new()))
                    .await
                    .unwrap(),
            );
            let host = Arc::new(FakeCluster::new());
            let virtual_cluster = Arc::new(FakeCluster::new());
            let translator =
                GenericTranslator::new("tenant-1", mapper, store.clone(), virtual_cluster.clone())
                    .with_denied_annotations(options.denied_annotations);
            let driver = Arc::new(GenericSyncer::new(
                translator,
                options,
                host.clone(),
                virtual_cluster.clone(),
            ));
            let mut builder = Context::builder(
                "tenant-1",
                driver,
                store.clone(),
                virtual_cluster.clone(),
                host.clone(),
            )
            .settings(self.settings);
            if let Some(events) = self.events {
                builder = builder.events(events);
            }
            Harness {
                ctx: Arc::new(builder.build()),
                store,
                host,
                virtual_cluster,
                ar: self.ar,
                kind,
            }
        }
    }

    impl Harness {
        fn create_virtual(&self, namespace: &str, name: &str, body: Value) -> ObjectIdentity {
            let obj = DynamicObject::new(name, &self.ar).within(namespace).data(body);
            self.virtual_cluster.insert(&self.kind, obj);
            ObjectIdentity::namespaced(self.kind.clone(), namespace, name)
        }

        fn create_cluster_virtual(&self, name: &str, body: Value) -> ObjectIdentity {
            let obj = DynamicObject::new(name, &self.ar).data(body);
            self.virtual_cluster.insert(&self.kind, obj);
            ObjectIdentity::cluster(self.kind.clone(), name)
        }

        fn virtual_object(&self, id: &ObjectIdentity) -> Arc<DynamicObject> {
            Arc::new(self.virtual_cluster.object(id).unwrap())
        }

        async fn reconcile(&self, id: &ObjectIdentity) -> Result<Action> {
            reconcile(self.virtual_object(id), self.ctx.clone()).await
        }

        fn physical_id(&self, id: &ObjectIdentity) -> ObjectIdentity {
            self.store.lookup(id).unwrap()
        }

        async fn delete_virtual(&self, id: &ObjectIdentity) {
            self.virtual_cluster.delete(&self.ar, id, None).await.unwrap();
        }
    }

    fn cm_body(value: &str) -> Value {
        json!({ "data": { "key": value } })
    }

    fn ingress_class_body(controller: &str) -> Value {
        json!({ "spec": { "controller": controller } })
    }

    /// Drop the cleanup finalizer and delete, as if the syncer was down
    async fn delete_virtual_behind_our_back(h: &Harness, id: &ObjectIdentity) {
        let mut obj = h.virtual_cluster.object(id).unwrap();
        obj.metadata.finalizers = None;
        h.virtual_cluster.insert(&h.kind, obj);
        h.delete_virtual(id).await;
    }

    // ==========================================================================
    // Story Tests: virtual side
    // ==========================================================================

    /// Story: syncing twice creates once, patches nothing and maps back
    #[tokio::test]
    async fn story_configmap_synced_twice() {
        let h = HarnessBuilder::config_maps().build().await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));

        let action = h.reconcile(&v).await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.settings.resync_interval));
        h.reconcile(&v).await.unwrap();

        assert_eq!(h.host.creates(), 1);
        assert_eq!(h.host.patches(), 0);
        assert_eq!(h.store.len(), 1);
        let p = h.physical_id(&v);
        assert_eq!(h.store.reverse_lookup(&p).unwrap(), v);

        let virtual_obj = h.virtual_object(&v);
        assert!(has_cleanup_finalizer(&virtual_obj));
    }

    /// Story: two tenants with the same namespace/name land on different host names
    #[tokio::test]
    async fn story_two_virtual_clusters_do_not_collide() {
        let a = HarnessBuilder::config_maps().build().await;
        let b = HarnessBuilder::config_maps()
            .translator(Arc::new(HashedNameTranslator::new("tenant-2", "host-ns")))
            .build()
            .await;
        let va = a.create_virtual("team-a", "cfg", cm_body("a"));
        let vb = b.create_virtual("team-a", "cfg", cm_body("b"));
        a.reconcile(&va).await.unwrap();
        b.reconcile(&vb).await.unwrap();
        assert_ne!(a.physical_id(&va), b.physical_id(&vb));
    }

    /// Story: host drift is overwritten by the virtual spec
    #[tokio::test]
    async fn story_host_drift_is_corrected() {
        let h = HarnessBuilder::config_maps().build().await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));
        h.reconcile(&v).await.unwrap();

        let p = h.physical_id(&v);
        let mut drifted = h.host.object(&p).unwrap();
        drifted.data = cm_body("edited-on-host");
        h.host.insert(&h.kind, drifted);

        h.reconcile(&v).await.unwrap();
        assert_eq!(h.host.patches(), 1);
        assert_eq!(h.host.object(&p).unwrap().data["data"]["key"], "value");
    }

    /// Story: a foreign host object blocks the sync without being touched
    #[tokio::test]
    async fn story_foreign_object_blocks_sync() {
        let mut events = MockEvents::new();
        events
            .expect_publish()
            .withf(|_, _, reason, _, _| reason == reasons::FOREIGN_OBJECT)
            .times(1)
            .returning(|_, _, _, _, _| ());
        let h = HarnessBuilder::config_maps().events(events).build().await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));

        let p = h.ctx.driver.mapper().physical_identity(&v).unwrap();
        let foreign = DynamicObject::new(&p.name, &h.ar)
            .within("host-ns")
            .data(cm_body("theirs"));
        h.host.insert(&h.kind, foreign);

        let obj = h.virtual_object(&v);
        let err = reconcile(obj.clone(), h.ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::ForeignObject { .. }));
        assert_eq!(
            error_policy(obj, &err, h.ctx.clone()),
            Action::requeue(Duration::from_secs(REQUEUE_FOREIGN_SECS))
        );
        assert_eq!(h.host.object(&p).unwrap().data["data"]["key"], "theirs");
        assert_eq!(h.host.patches(), 0);
    }

    /// Story: deleting the virtual object deletes the host object, then the
    /// mapping, then releases the finalizer
    #[tokio::test]
    async fn story_deletion_cleans_up_host_then_mapping() {
        let h = HarnessBuilder::config_maps().build().await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));
        h.reconcile(&v).await.unwrap();
        let p = h.physical_id(&v);

        h.delete_virtual(&v).await;
        let action = h.reconcile(&v).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(h.host.object(&p).is_none());
        assert!(h.store.is_empty());
        assert!(h.virtual_cluster.object(&v).is_none());
    }

    /// Story: the mapping survives while the host object is still terminating
    #[tokio::test]
    async fn story_deletion_waits_for_host_termination() {
        let h = HarnessBuilder::config_maps().build().await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));
        h.reconcile(&v).await.unwrap();
        let p = h.physical_id(&v);

        // A host-side controller holds the object with its own finalizer
        let mut physical = h.host.object(&p).unwrap();
        physical.metadata.finalizers = Some(vec!["host.example/protect".into()]);
        h.host.insert(&h.kind, physical);

        h.delete_virtual(&v).await;
        let action = h.reconcile(&v).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_DELETING_SECS)));
        assert_eq!(h.store.len(), 1);
        assert!(h.virtual_cluster.object(&v).is_some());

        // Host controller lets go
        h.host
            .patch(&h.ar, &p, &json!({"metadata": {"finalizers": null}}))
            .await
            .unwrap();
        assert!(h.host.object(&p).is_none());

        let action = h.reconcile(&v).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(h.store.is_empty());
        assert!(h.virtual_cluster.object(&v).is_none());
        assert_eq!(h.host.deletes(), 1);
    }

    /// Story: an object deleted before it ever reached the host just drops its finalizer
    #[tokio::test]
    async fn story_never_materialized_deletion() {
        let h = HarnessBuilder::config_maps().build().await;
        let mut obj = DynamicObject::new("cfg", &h.ar)
            .within("team-a")
            .data(cm_body("value"));
        obj.metadata.finalizers = Some(vec![HOST_CLEANUP_FINALIZER.into()]);
        obj.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        h.virtual_cluster.insert(&h.kind, obj);
        let v = ObjectIdentity::namespaced(h.kind.clone(), "team-a", "cfg");

        let action = h.reconcile(&v).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(h.host.deletes(), 0);
        assert!(h.virtual_cluster.object(&v).is_none());
    }

    /// Story: a hash collision is a retryable conflict that warns once at the threshold
    #[tokio::test]
    async fn story_collision_warns_after_threshold() {
        let mut events = MockEvents::new();
        events
            .expect_publish()
            .withf(|_, _, reason, _, _| reason == reasons::MAPPING_CONFLICT)
            .times(1)
            .returning(|_, _, _, _, _| ());
        events
            .expect_publish()
            .withf(|_, _, reason, _, _| reason != reasons::MAPPING_CONFLICT)
            .returning(|_, _, _, _, _| ());
        let h = HarnessBuilder::config_maps()
            .translator(Arc::new(Colliding))
            .events(events)
            .conflict_threshold(3)
            .build()
            .await;

        let first = h.create_virtual("team-a", "cfg", cm_body("a"));
        let second = h.create_virtual("team-b", "cfg", cm_body("b"));
        h.reconcile(&first).await.unwrap();

        for _ in 0..4 {
            let obj = h.virtual_object(&second);
            let err = reconcile(obj.clone(), h.ctx.clone()).await.unwrap_err();
            assert!(err.is_conflict());
            let action = error_policy(obj, &err, h.ctx.clone());
            assert_ne!(action, Action::await_change());
        }

        assert_eq!(h.ctx.backoff.attempts(&second), 4);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.host.creates(), 1);
        let p = h.physical_id(&first);
        assert_eq!(h.store.reverse_lookup(&p).unwrap(), first);
    }

    /// Story: a host outage backs off, warns once and recovers
    #[tokio::test]
    async fn story_transient_outage_recovers() {
        let mut events = MockEvents::new();
        events
            .expect_publish()
            .withf(|_, _, reason, _, _| reason == reasons::SYNC_FAILED)
            .times(1)
            .returning(|_, _, _, _, _| ());
        events
            .expect_publish()
            .withf(|_, _, reason, _, _| reason == reasons::SYNCED_TO_HOST)
            .times(1)
            .returning(|_, _, _, _, _| ());
        let h = HarnessBuilder::config_maps().events(events).build().await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));

        h.host.set_unavailable(true);
        for attempt in 1..=2 {
            let err = h.reconcile(&v).await.unwrap_err();
            assert!(err.is_retryable());
            assert_eq!(h.ctx.backoff.attempts(&v), attempt);
        }
        // The mapping is kept; the next attempt reuses it
        assert_eq!(h.store.len(), 1);

        h.host.set_unavailable(false);
        h.reconcile(&v).await.unwrap();
        assert_eq!(h.ctx.backoff.attempts(&v), 0);
        assert_eq!(h.host.len(), 1);
    }

    /// Story: a LoadBalancer address assigned on the host shows up in the tenant
    #[tokio::test]
    async fn story_service_status_flows_back() {
        let h = HarnessBuilder::services().build().await;
        let v = h.create_virtual(
            "team-a",
            "web",
            json!({"spec": {"type": "LoadBalancer", "ports": [{"port": 80}]}}),
        );
        h.reconcile(&v).await.unwrap();

        let p = h.physical_id(&v);
        let mut physical = h.host.object(&p).unwrap();
        physical.data["status"] = json!({"loadBalancer": {"ingress": [{"ip": "203.0.113.7"}]}});
        h.host.insert(&h.kind, physical);

        h.reconcile(&v).await.unwrap();
        let virtual_obj = h.virtual_object(&v);
        assert_eq!(
            virtual_obj.data["status"]["loadBalancer"]["ingress"][0]["ip"],
            "203.0.113.7"
        );
        assert_eq!(h.host.patches(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_before_any_write() {
        let h = HarnessBuilder::config_maps().build().await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));
        h.ctx.shutdown.cancel();

        let err = h.reconcile(&v).await.unwrap_err();
        assert!(matches!(err, Error::Transient { .. }));
        assert_eq!(h.host.creates(), 0);
        assert_eq!(h.virtual_cluster.patches(), 0);
    }

    /// Story: a stalled host call is abandoned at the deadline and retried with backoff
    #[tokio::test(start_paused = true)]
    async fn story_stalled_reconcile_times_out_and_retries() {
        let h = HarnessBuilder::config_maps()
            .timeout(Duration::from_secs(5))
            .build()
            .await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));

        h.host.set_stalled(true);
        let started = tokio::time::Instant::now();
        let obj = h.virtual_object(&v);
        let err = reconcile(obj.clone(), h.ctx.clone()).await.unwrap_err();

        assert!(started.elapsed() >= Duration::from_secs(5));
        match &err {
            Error::Transient { context, message } => {
                assert_eq!(context, "reconcile");
                assert!(message.contains("timed out"), "{message}");
            }
            other => panic!("expected a transient error, got {other:?}"),
        }
        assert_eq!(h.ctx.backoff.attempts(&v), 1);
        let action = error_policy(obj, &err, h.ctx.clone());
        assert_ne!(action, Action::await_change());
        assert_ne!(action, Action::requeue(Duration::from_secs(REQUEUE_FOREIGN_SECS)));
        // Only this reconcile was cancelled, not the controller
        assert!(!h.ctx.shutdown.is_cancelled());
        assert_eq!(h.host.creates(), 0);

        h.host.set_stalled(false);
        h.reconcile(&v).await.unwrap();
        assert_eq!(h.host.creates(), 1);
        assert_eq!(h.ctx.backoff.attempts(&v), 0);
    }

    #[tokio::test]
    async fn malformed_objects_wait_for_change() {
        let h = HarnessBuilder::config_maps().build().await;
        let obj = Arc::new(DynamicObject::new("cfg", &h.ar).within("team-a"));
        let err = Error::translation("ConfigMap team-a/cfg", "bad");
        assert_eq!(error_policy(obj, &err, h.ctx.clone()), Action::await_change());
    }

    // ==========================================================================
    // Story Tests: mirrored kinds
    // ==========================================================================

    /// Story: a mirrored IngressClass lands on the host under its own name
    #[tokio::test]
    async fn story_ingress_class_is_mirrored() {
        let h = HarnessBuilder::ingress_classes().build().await;
        let mut obj = DynamicObject::new("nginx", &h.ar).data(ingress_class_body("k8s.io/nginx"));
        obj.metadata.annotations = Some(
            [(DEFAULT_INGRESS_CLASS_ANNOTATION.to_string(), "true".to_string())].into(),
        );
        h.virtual_cluster.insert(&h.kind, obj);
        let v = ObjectIdentity::cluster(h.kind.clone(), "nginx");

        h.reconcile(&v).await.unwrap();
        h.reconcile(&v).await.unwrap();

        let p = h.physical_id(&v);
        assert_eq!(p, v);
        assert!(p.namespace.is_none());
        assert_eq!(h.host.creates(), 1);
        assert_eq!(h.host.patches(), 0);

        let physical = h.host.object(&p).unwrap();
        assert!(marker::has_marker(physical.metadata.labels.as_ref(), "tenant-1"));
        assert_eq!(physical.data["spec"]["controller"], "k8s.io/nginx");
        let annotations = physical.metadata.annotations.unwrap_or_default();
        assert!(!annotations.contains_key(DEFAULT_INGRESS_CLASS_ANNOTATION));
        assert!(has_cleanup_finalizer(&h.virtual_object(&v)));
    }

    /// Story: a host IngressClass of the same name that is not ours is never adopted
    #[tokio::test]
    async fn story_mirrored_name_taken_on_host() {
        let h = HarnessBuilder::ingress_classes().build().await;
        let v = h.create_cluster_virtual("nginx", ingress_class_body("tenant/nginx"));
        let host_owned =
            DynamicObject::new("nginx", &h.ar).data(ingress_class_body("k8s.io/nginx"));
        h.host.insert(&h.kind, host_owned);

        let err = h.reconcile(&v).await.unwrap_err();
        assert!(matches!(err, Error::ForeignObject { .. }));
        assert_eq!(h.host.object(&v).unwrap().data["spec"]["controller"], "k8s.io/nginx");
        assert_eq!(h.host.patches(), 0);
        assert_eq!(h.host.creates(), 0);

        // Finalizing must leave the host object in place as well
        h.delete_virtual(&v).await;
        h.reconcile(&v).await.unwrap();
        assert!(h.host.object(&v).is_some());
        assert_eq!(h.host.deletes(), 0);
        assert!(h.store.is_empty());
        assert!(h.virtual_cluster.object(&v).is_none());
    }

    /// Story: deleting a mirrored IngressClass removes the host copy and the mapping
    #[tokio::test]
    async fn story_mirrored_deletion_cleans_up() {
        let h = HarnessBuilder::ingress_classes().build().await;
        let v = h.create_cluster_virtual("nginx", ingress_class_body("k8s.io/nginx"));
        h.reconcile(&v).await.unwrap();
        assert!(h.host.object(&v).is_some());

        h.delete_virtual(&v).await;
        let action = h.reconcile(&v).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(h.host.object(&v).is_none());
        assert_eq!(h.host.deletes(), 1);
        assert!(h.store.is_empty());
        assert!(h.virtual_cluster.object(&v).is_none());
    }

    /// Story: the collector removes a mirrored copy whose owner vanished and
    /// keeps the ones still backed by a virtual object
    #[tokio::test]
    async fn story_mirrored_orphan_is_collected() {
        let h = HarnessBuilder::ingress_classes().build().await;
        let gone = h.create_cluster_virtual("nginx", ingress_class_body("k8s.io/nginx"));
        let live = h.create_cluster_virtual("traefik", ingress_class_body("traefik.io/ingress"));
        h.reconcile(&gone).await.unwrap();
        h.reconcile(&live).await.unwrap();

        delete_virtual_behind_our_back(&h, &gone).await;

        let physical = Arc::new(h.host.object(&gone).unwrap());
        let action = reconcile_physical(physical, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(h.host.object(&gone).is_none());
        assert!(h.store.get(&gone).is_none());

        let physical = Arc::new(h.host.object(&live).unwrap());
        let action = reconcile_physical(physical, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.settings.resync_interval));
        assert!(h.host.object(&live).is_some());
        assert_eq!(h.physical_id(&live), live);
        assert_eq!(h.host.deletes(), 1);
    }

    // ==========================================================================
    // Story Tests: physical side
    // ==========================================================================

    /// Story: a host object whose virtual owner vanished is collected with its mapping
    #[tokio::test]
    async fn story_orphan_is_collected() {
        let h = HarnessBuilder::config_maps().build().await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));
        h.reconcile(&v).await.unwrap();
        let p = h.physical_id(&v);

        delete_virtual_behind_our_back(&h, &v).await;

        let physical = Arc::new(h.host.object(&p).unwrap());
        let action = reconcile_physical(physical, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(h.host.object(&p).is_none());
        assert!(h.store.is_empty());
    }

    /// Story: live and foreign host objects are left alone by the collector
    #[tokio::test]
    async fn story_collector_spares_live_and_foreign_objects() {
        let h = HarnessBuilder::config_maps().build().await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));
        h.reconcile(&v).await.unwrap();
        let p = h.physical_id(&v);

        let live = Arc::new(h.host.object(&p).unwrap());
        let action = reconcile_physical(live, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.settings.resync_interval));

        let foreign = DynamicObject::new("someone-elses", &h.ar)
            .within("host-ns")
            .data(cm_body("x"));
        let foreign = Arc::new(h.host.insert(&h.kind, foreign));
        let action = reconcile_physical(foreign, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        assert_eq!(h.host.deletes(), 0);
        assert_eq!(h.host.len(), 2);
    }

    /// Story: a lost store does not stop the collector from finding the owner
    #[tokio::test]
    async fn story_collector_falls_back_to_owner_annotations() {
        let h = HarnessBuilder::config_maps().build().await;
        let v = h.create_virtual("team-a", "cfg", cm_body("value"));
        h.reconcile(&v).await.unwrap();
        let p = h.physical_id(&v);
        h.store.delete(&v).await.unwrap();

        // Owner still exists: keep
        let physical = Arc::new(h.host.object(&p).unwrap());
        reconcile_physical(physical.clone(), h.ctx.clone())
            .await
            .unwrap();
        assert!(h.host.object(&p).is_some());

        // Owner gone: collect
        delete_virtual_behind_our_back(&h, &v).await;
        reconcile_physical(physical, h.ctx.clone()).await.unwrap();
        assert!(h.host.object(&p).is_none());
    }
}
