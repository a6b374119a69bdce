//! Controller runner - builds controller futures for each synced kind
//!
//! Every kind gets two controllers sharing one [`Context`]:
//! - virtual side: watches the kind in the virtual cluster, plus managed
//!   host objects mapped back to their virtual owner so drift is corrected
//!   promptly
//! - physical side: watches managed host objects and collects orphans

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use vsync_common::events::EventPublisher;
use vsync_common::{marker, ResourceKind, Result, WATCH_TIMEOUT_SECS};
use vsync_mappings::{Mapper, MapperRegistry, MappingStore, SyncedKind};

use crate::client::{KubeObjectClient, ObjectClient};
use crate::context::{Context, ReconcileSettings};
use crate::reconciler::{error_policy, error_policy_physical, reconcile, reconcile_physical};
use crate::resources::sync_options;
use crate::syncer::GenericSyncer;
use crate::translator::GenericTranslator;

/// A controller future ready to be driven
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Everything the controllers of all kinds share
pub struct SyncerRuntime {
    /// Virtual cluster this syncer serves
    pub vcluster_name: String,
    /// Host namespace for namespaced kinds
    pub target_namespace: String,
    /// Client for the virtual cluster
    pub virtual_client: Client,
    /// Client for the host cluster
    pub host_client: Client,
    /// Identity mappings
    pub store: Arc<MappingStore>,
    /// Events on virtual objects
    pub events: Arc<dyn EventPublisher>,
    /// Reconcile timing
    pub settings: ReconcileSettings,
    /// Concurrent reconciles per controller
    pub workers: u16,
    /// Cancelled on shutdown
    pub shutdown: CancellationToken,
}

impl SyncerRuntime {
    fn host_api(&self, mapper: &Mapper) -> Api<DynamicObject> {
        if mapper.is_namespaced() {
            Api::namespaced_with(
                self.host_client.clone(),
                &self.target_namespace,
                mapper.api_resource(),
            )
        } else {
            Api::all_with(self.host_client.clone(), mapper.api_resource())
        }
    }

    fn managed_watcher(&self) -> WatcherConfig {
        WatcherConfig::default()
            .timeout(WATCH_TIMEOUT_SECS)
            .labels(&marker::managed_selector(&self.vcluster_name))
    }
}

/// Build the shared reconcile context for one kind
pub fn build_context(rt: &SyncerRuntime, kind: SyncedKind, mapper: Arc<Mapper>) -> Arc<Context> {
    let virtual_client: Arc<dyn ObjectClient> =
        Arc::new(KubeObjectClient::new(rt.virtual_client.clone()));
    let host_client: Arc<dyn ObjectClient> =
        Arc::new(KubeObjectClient::new(rt.host_client.clone()));

    let options = sync_options(kind);
    let translator = GenericTranslator::new(
        rt.vcluster_name.clone(),
        mapper,
        rt.store.clone(),
        virtual_client.clone(),
    )
    .with_denied_annotations(options.denied_annotations);
    let driver = Arc::new(GenericSyncer::new(
        translator,
        options,
        host_client.clone(),
        virtual_client.clone(),
    ));

    Arc::new(
        Context::builder(
            rt.vcluster_name.clone(),
            driver,
            rt.store.clone(),
            virtual_client,
            host_client,
        )
        .events(rt.events.clone())
        .settings(rt.settings.clone())
        .shutdown(rt.shutdown.clone())
        .build(),
    )
}

/// Virtual owner of a managed host object, as a controller trigger
pub fn virtual_ref_for(
    kind: &ResourceKind,
    vcluster_name: &str,
    ar: &ApiResource,
    physical: &DynamicObject,
) -> Option<ObjectRef<DynamicObject>> {
    if !marker::has_marker(physical.metadata.labels.as_ref(), vcluster_name) {
        return None;
    }
    let owner = marker::owner_from_annotations(kind, physical.metadata.annotations.as_ref())?;
    let obj_ref = ObjectRef::new_with(&owner.name, ar.clone());
    Some(match &owner.namespace {
        Some(ns) => obj_ref.within(ns),
        None => obj_ref,
    })
}

/// Build the virtual-side and physical-side controllers for one kind
pub fn build_kind_controllers(rt: &SyncerRuntime, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let mapper = ctx.driver.mapper();
    let ar = mapper.api_resource().clone();
    let kind = mapper.kind().clone();
    let config = ControllerConfig::default().concurrency(rt.workers);

    let virtual_api: Api<DynamicObject> = Api::all_with(rt.virtual_client.clone(), &ar);

    let trigger_kind = kind.clone();
    let trigger_vcluster = rt.vcluster_name.clone();
    let trigger_ar = ar.clone();
    let virtual_ctrl = Controller::new_with(
        virtual_api,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        ar.clone(),
    )
    .with_config(config.clone())
    .watches_with(
        rt.host_api(mapper),
        ar.clone(),
        rt.managed_watcher(),
        move |physical| virtual_ref_for(&trigger_kind, &trigger_vcluster, &trigger_ar, &physical),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx.clone())
    .for_each(log_reconcile_result(kind.to_string(), "virtual"));

    let physical_ctrl = Controller::new_with(rt.host_api(mapper), rt.managed_watcher(), ar)
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile_physical, error_policy_physical, ctx.clone())
        .for_each(log_reconcile_result(kind.to_string(), "physical"));

    vec![Box::pin(virtual_ctrl), Box::pin(physical_ctrl)]
}

/// Build controllers for every enabled kind
pub fn build_controllers(
    rt: &SyncerRuntime,
    registry: &MapperRegistry,
    kinds: &[SyncedKind],
) -> Result<Vec<ControllerFuture>> {
    let mut controllers = Vec::new();
    for kind in kinds {
        let mapper = registry.mapper_for(&kind.resource_kind())?;
        let ctx = build_context(rt, *kind, mapper);
        controllers.extend(build_kind_controllers(rt, ctx));
        tracing::info!("- {} controllers", kind);
    }
    Ok(controllers)
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    kind: String,
    side: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, %kind, side, "reconciliation completed"),
            Err(e) => tracing::warn!(error = ?e, %kind, side, "reconciliation error"),
        }
        std::future::ready(())
    }
}
