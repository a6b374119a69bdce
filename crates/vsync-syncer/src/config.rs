//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use vsync_common::retry::Backoff;
use vsync_common::{Error, Result};
use vsync_mappings::SyncedKind;

use crate::context::ReconcileSettings;

/// vsync - keeps virtual cluster objects materialized on a shared host cluster
#[derive(Parser, Debug)]
#[command(name = "vsync-syncer", version, about, long_about = None)]
pub struct Cli {
    /// Settings shared by every subcommand
    #[command(flatten)]
    pub config: SyncerConfig,

    /// Mode; `run` when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the syncer (default mode)
    Run,
    /// Delete the virtual cluster's own pods and wait until they are Ready again
    RestartWorkloads(RestartArgs),
}

/// Arguments of `restart-workloads`
#[derive(Args, Debug, PartialEq, Eq)]
pub struct RestartArgs {
    /// Release whose pods are restarted (defaults to the virtual cluster name)
    #[arg(long, env = "VSYNC_RELEASE")]
    pub release: Option<String>,

    /// Namespace of the release on the host (defaults to the target namespace)
    #[arg(long, env = "VSYNC_RELEASE_NAMESPACE")]
    pub namespace: Option<String>,
}

/// Persistence medium of the Mapping Store
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MappingStoreKind {
    /// One ConfigMap in the target namespace
    #[value(name = "configmap")]
    ConfigMap,
    /// Process memory only; mappings are rebuilt by startup recovery
    Memory,
}

/// Syncer settings
#[derive(Args, Debug, Clone)]
pub struct SyncerConfig {
    /// Name of the virtual cluster; stamped into every ownership marker
    #[arg(long, env = "VSYNC_VCLUSTER_NAME")]
    pub vcluster_name: String,

    /// Host namespace that receives namespaced objects
    #[arg(long, env = "VSYNC_TARGET_NAMESPACE")]
    pub target_namespace: String,

    /// Kubeconfig of the virtual cluster (inferred when unset)
    #[arg(long, env = "VSYNC_VIRTUAL_KUBECONFIG")]
    pub virtual_kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the host cluster (in-cluster config when unset)
    #[arg(long, env = "VSYNC_HOST_KUBECONFIG")]
    pub host_kubeconfig: Option<PathBuf>,

    /// Where mappings are persisted
    #[arg(
        long,
        env = "VSYNC_MAPPING_STORE",
        value_enum,
        default_value_t = MappingStoreKind::ConfigMap
    )]
    pub mapping_store: MappingStoreKind,

    /// Name of the ConfigMap holding mappings
    #[arg(long, env = "VSYNC_MAPPING_CONFIGMAP", default_value = "vsync-mappings")]
    pub mapping_configmap: String,

    /// Resource kinds to sync, comma separated
    #[arg(
        long,
        env = "VSYNC_RESOURCES",
        value_delimiter = ',',
        default_values_t = SyncedKind::ALL.to_vec()
    )]
    pub resources: Vec<SyncedKind>,

    /// Concurrent reconciles per controller
    #[arg(long, env = "VSYNC_WORKERS", default_value_t = 8)]
    pub workers: u16,

    /// Upper bound for a single reconcile
    #[arg(long, env = "VSYNC_RECONCILE_TIMEOUT_SECS", default_value_t = 30)]
    pub reconcile_timeout_secs: u64,

    /// Periodic resync of synced objects
    #[arg(long, env = "VSYNC_RESYNC_INTERVAL_SECS", default_value_t = 300)]
    pub resync_interval_secs: u64,

    /// Delay after the first failure
    #[arg(long, env = "VSYNC_BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,

    /// Cap on the retry delay
    #[arg(long, env = "VSYNC_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Conflict retries before a warning event is published
    #[arg(long, env = "VSYNC_CONFLICT_WARNING_THRESHOLD", default_value_t = 5)]
    pub conflict_warning_threshold: u32,

    /// Emit JSON logs
    #[arg(long, env = "VSYNC_JSON_LOGS")]
    pub json_logs: bool,
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends, at most 63 chars
fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

impl SyncerConfig {
    /// Reject settings that would break naming or scheduling
    pub fn validate(&self) -> Result<()> {
        if !is_dns_label(&self.vcluster_name) {
            return Err(Error::validation_for_field(
                "--vcluster-name",
                format!("'{}' is not a DNS-1123 label", self.vcluster_name),
            ));
        }
        if !is_dns_label(&self.target_namespace) {
            return Err(Error::validation_for_field(
                "--target-namespace",
                format!("'{}' is not a DNS-1123 label", self.target_namespace),
            ));
        }
        if self.workers == 0 {
            return Err(Error::validation_for_field("--workers", "must be > 0"));
        }
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::validation_for_field(
                "--reconcile-timeout-secs",
                "must be > 0",
            ));
        }
        if self.backoff().base > self.backoff().max {
            return Err(Error::validation_for_field(
                "--backoff-base-ms",
                "backoff base must not exceed --backoff-max-secs",
            ));
        }
        if self.resources.is_empty() {
            return Err(Error::validation_for_field(
                "--resources",
                "at least one resource kind must be enabled",
            ));
        }
        Ok(())
    }

    /// Retry policy
    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_secs(self.backoff_max_secs),
        }
    }

    /// Reconciler settings
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            timeout: Duration::from_secs(self.reconcile_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            conflict_warning_threshold: self.conflict_warning_threshold,
            backoff: self.backoff(),
        }
    }
}
