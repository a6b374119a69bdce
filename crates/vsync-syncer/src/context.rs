//! Controller context and the per-reconcile SyncContext.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;
use vsync_common::events::{EventPublisher, NoopEventPublisher};
use vsync_common::retry::{Backoff, BackoffTracker};
use vsync_common::{Error, ObjectIdentity, Result};
use vsync_mappings::{Mapping, MappingStore};

use crate::client::ObjectClient;
use crate::syncer::SyncDriver;

/// Reconcile timing and escalation settings
#[derive(Clone, Debug)]
pub struct ReconcileSettings {
    /// Upper bound for a single reconcile
    pub timeout: Duration,
    /// Requeue interval after a successful reconcile
    pub resync_interval: Duration,
    /// Conflict retries before a warning event is published
    pub conflict_warning_threshold: u32,
    /// Backoff policy for retryable failures
    pub backoff: Backoff,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            resync_interval: Duration::from_secs(300),
            conflict_warning_threshold: 5,
            backoff: Backoff::default(),
        }
    }
}

/// Shared state of the controllers for one kind
pub struct Context {
    /// Virtual cluster this syncer serves
    pub vcluster_name: String,
    /// Translator and sync driver for the kind
    pub driver: Arc<dyn SyncDriver>,
    /// Identity mappings
    pub store: Arc<MappingStore>,
    /// Client for the virtual cluster
    pub virtual_client: Arc<dyn ObjectClient>,
    /// Client for the host cluster
    pub host_client: Arc<dyn ObjectClient>,
    /// Events published on virtual objects
    pub events: Arc<dyn EventPublisher>,
    /// Per-identity failure counters
    pub backoff: BackoffTracker<ObjectIdentity>,
    /// Timing settings
    pub settings: ReconcileSettings,
    /// Cancelled on process shutdown
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        vcluster_name: impl Into<String>,
        driver: Arc<dyn SyncDriver>,
        store: Arc<MappingStore>,
        virtual_client: Arc<dyn ObjectClient>,
        host_client: Arc<dyn ObjectClient>,
    ) -> ContextBuilder {
        ContextBuilder {
            vcluster_name: vcluster_name.into(),
            driver,
            store,
            virtual_client,
            host_client,
            events: None,
            settings: ReconcileSettings::default(),
            shutdown: None,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    vcluster_name: String,
    driver: Arc<dyn SyncDriver>,
    store: Arc<MappingStore>,
    virtual_client: Arc<dyn ObjectClient>,
    host_client: Arc<dyn ObjectClient>,
    events: Option<Arc<dyn EventPublisher>>,
    settings: ReconcileSettings,
    shutdown: Option<CancellationToken>,
}

impl ContextBuilder {
    /// Set the event publisher (defaults to a no-op publisher)
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override timing settings
    pub fn settings(mut self, settings: ReconcileSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the shutdown token
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            vcluster_name: self.vcluster_name,
            driver: self.driver,
            store: self.store,
            virtual_client: self.virtual_client,
            host_client: self.host_client,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            backoff: BackoffTracker::new(self.settings.backoff.clone()),
            settings: self.settings,
            shutdown: self.shutdown.unwrap_or_default(),
        }
    }
}

/// Per-reconcile state, owned by the reconcile call that created it
pub struct SyncContext {
    /// Mapping resolved for the object, once known
    pub mapping: Option<Mapping>,
    /// Reference to the virtual object, for events
    pub object_ref: ObjectReference,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Cancelled on timeout or shutdown
    pub cancel: CancellationToken,
}

impl SyncContext {
    /// New context for one reconcile of `object_ref`
    pub fn new(
        object_ref: ObjectReference,
        events: Arc<dyn EventPublisher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mapping: None,
            object_ref,
            events,
            cancel,
        }
    }

    /// Fail with a transient error once cancelled; called before every write
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::transient_with_context("reconcile", "cancelled"));
        }
        Ok(())
    }

    /// Publish a Normal event on the virtual object
    pub async fn normal(&self, reason: &str, action: &str, note: String) {
        self.events
            .publish(&self.object_ref, EventType::Normal, reason, action, Some(note))
            .await;
    }

    /// Publish a Warning event on the virtual object
    pub async fn warning(&self, reason: &str, action: &str, note: String) {
        self.events
            .publish(&self.object_ref, EventType::Warning, reason, action, Some(note))
            .await;
    }
}
