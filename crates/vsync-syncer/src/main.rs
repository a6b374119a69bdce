//! vsync-syncer - resource sync between a virtual cluster and its host

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;

use vsync_common::events::KubeEventPublisher;
use vsync_common::retry::{retry_with_backoff, RetryConfig};
use vsync_common::telemetry::init_tracing;
use vsync_mappings::{
    register_all, ConfigMapBackend, HashedNameTranslator, MapperRegistry, MappingBackend,
    MappingStore, MemoryBackend, RegisterContext,
};
use vsync_syncer::config::{Cli, Command, MappingStoreKind, RestartArgs, SyncerConfig};
use vsync_syncer::controller_runner::{build_controllers, SyncerRuntime};
use vsync_syncer::lifecycle::restart_workloads;
use vsync_syncer::recovery::recover_mappings;
use vsync_syncer::KubeObjectClient;

/// Startup recovery attempts before giving up
const RECOVERY_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.config.json_logs);
    cli.config.validate()?;

    match cli.command {
        Some(Command::Run) | None => run(cli.config).await,
        Some(Command::RestartWorkloads(args)) => restart(cli.config, args).await,
    }
}

async fn client_from(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// Token cancelled on Ctrl-C
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, cancelling in-flight reconciles");
        }
        on_signal.cancel();
    });
    token
}

async fn run(config: SyncerConfig) -> anyhow::Result<()> {
    tracing::info!(
        vcluster = %config.vcluster_name,
        target_namespace = %config.target_namespace,
        "Starting vsync syncer"
    );

    let host_client = client_from(config.host_kubeconfig.as_deref())
        .await
        .context("building host cluster client")?;
    let virtual_client = client_from(config.virtual_kubeconfig.as_deref())
        .await
        .context("building virtual cluster client")?;

    // Every mapper must be registered before any reconciler starts
    let translator = Arc::new(HashedNameTranslator::new(
        config.vcluster_name.clone(),
        config.target_namespace.clone(),
    ));
    let mut registry = MapperRegistry::new();
    register_all(
        &mut registry,
        &RegisterContext::new(translator),
        &config.resources,
    )?;

    let backend: Arc<dyn MappingBackend> = match config.mapping_store {
        MappingStoreKind::ConfigMap => {
            let backend = ConfigMapBackend::new(
                host_client.clone(),
                &config.target_namespace,
                config.mapping_configmap.clone(),
            );
            backend.ensure().await.context("preparing mapping ConfigMap")?;
            Arc::new(backend)
        }
        MappingStoreKind::Memory => {
            tracing::warn!("Mappings are kept in memory only and rebuilt from the host on restart");
            Arc::new(MemoryBackend::new())
        }
    };
    let store = Arc::new(MappingStore::open(backend).await?);

    let host_objects = KubeObjectClient::new(host_client.clone());
    let report = retry_with_backoff(
        &RetryConfig::with_max_attempts(RECOVERY_ATTEMPTS),
        "mapping recovery",
        || {
            recover_mappings(
                &config.vcluster_name,
                &config.target_namespace,
                &registry,
                &store,
                &host_objects,
            )
        },
    )
    .await
    .context("recovering mappings from the host")?;
    tracing::info!(?report, mappings = store.len(), "Mapping store ready");

    let runtime = SyncerRuntime {
        vcluster_name: config.vcluster_name.clone(),
        target_namespace: config.target_namespace.clone(),
        events: Arc::new(KubeEventPublisher::new(virtual_client.clone(), "vsync-syncer")),
        virtual_client,
        host_client,
        store,
        settings: config.reconcile_settings(),
        workers: config.workers,
        shutdown: shutdown_token(),
    };

    tracing::info!("Starting controllers:");
    let controllers = build_controllers(&runtime, &registry, &config.resources)?;
    futures::future::join_all(controllers).await;

    tracing::info!("All controllers stopped");
    Ok(())
}

async fn restart(config: SyncerConfig, args: RestartArgs) -> anyhow::Result<()> {
    let release = args.release.unwrap_or(config.vcluster_name);
    let namespace = args.namespace.unwrap_or(config.target_namespace);

    let host_client = client_from(config.host_kubeconfig.as_deref())
        .await
        .context("building host cluster client")?;
    let deleted = restart_workloads(
        &KubeObjectClient::new(host_client),
        &namespace,
        &release,
        &shutdown_token(),
    )
    .await?;

    tracing::info!(%release, %namespace, deleted, "Virtual cluster restarted");
    Ok(())
}
