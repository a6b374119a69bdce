//! Helpers for tooling that operates on a virtual cluster from the host side.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{ApiResource, DynamicObject};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vsync_common::retry::poll_until;
use vsync_common::{marker, ObjectIdentity, ResourceKind, Result};

use crate::client::ObjectClient;

/// Poll interval while waiting for pods
pub const POD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long a restart waits for pods to come back
pub const POD_READY_TIMEOUT: Duration = Duration::from_secs(300);

fn pods() -> ApiResource {
    ApiResource::erase::<Pod>(&())
}

fn is_ready(pod: &DynamicObject) -> bool {
    pod.data
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
}

/// Delete every pod matching `selector` in `namespace`; returns how many
/// deletions were issued.
pub async fn delete_pods(
    client: &dyn ObjectClient,
    namespace: &str,
    selector: &str,
) -> Result<usize> {
    let ar = pods();
    let kind = ResourceKind::from_api_resource(&ar);
    let mut deleted = 0;

    for pod in client.list(&ar, Some(namespace), selector).await? {
        let id = ObjectIdentity::from_meta(kind.clone(), &pod.metadata)?;
        if client.delete(&ar, &id, pod.metadata.uid.as_deref()).await? {
            debug!(pod = %id, "deleted pod");
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Wait until at least one pod matches and every live matching pod is Ready
pub async fn wait_for_pods_ready(
    client: &dyn ObjectClient,
    namespace: &str,
    selector: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let ar = pods();
    poll_until(interval, timeout, cancel, || {
        let ar = &ar;
        async move {
            let live: Vec<DynamicObject> = client
                .list(ar, Some(namespace), selector)
                .await?
                .into_iter()
                .filter(|p| p.metadata.deletion_timestamp.is_none())
                .collect();
            Ok(!live.is_empty() && live.iter().all(is_ready))
        }
    })
    .await
}

/// Restart the virtual cluster's own pods and wait for them to be Ready again
pub async fn restart_workloads(
    client: &dyn ObjectClient,
    namespace: &str,
    release: &str,
    cancel: &CancellationToken,
) -> Result<usize> {
    let selector = marker::workload_selector(release);
    let deleted = delete_pods(client, namespace, &selector).await?;
    info!(release, namespace, deleted, "deleted virtual cluster pods");

    wait_for_pods_ready(
        client,
        namespace,
        &selector,
        POD_POLL_INTERVAL,
        POD_READY_TIMEOUT,
        cancel,
    )
    .await?;
    info!(release, namespace, "virtual cluster pods are ready");
    Ok(deleted)
}
