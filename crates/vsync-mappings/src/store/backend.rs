//! Persistence backends for the Mapping Store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};
use vsync_common::{Error, ObjectIdentity, Result, FIELD_MANAGER};

#[cfg(test)]
use mockall::automock;

use super::{storage_key, Mapping};

/// Durable storage for mapping records.
///
/// Entries are keyed by [`storage_key`] of the virtual identity, so writes for
/// distinct identities never touch the same key.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MappingBackend: Send + Sync {
    /// Load every persisted record
    async fn load(&self) -> Result<Vec<Mapping>>;

    /// Insert or replace the record for `mapping.virtual_identity`
    async fn put(&self, mapping: &Mapping) -> Result<()>;

    /// Remove the record for a virtual identity; absent is not an error
    async fn remove(&self, virtual_identity: &ObjectIdentity) -> Result<()>;
}

/// Process-local backend. Mappings do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Mapping>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no record is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl MappingBackend for MemoryBackend {
    async fn load(&self) -> Result<Vec<Mapping>> {
        Ok(self.entries.iter().map(|e| e.value().clone()).collect())
    }

    async fn put(&self, mapping: &Mapping) -> Result<()> {
        self.entries.insert(mapping.storage_key(), mapping.clone());
        Ok(())
    }

    async fn remove(&self, virtual_identity: &ObjectIdentity) -> Result<()> {
        self.entries.remove(&storage_key(virtual_identity));
        Ok(())
    }
}

/// Label placed on the ConfigMap holding the mappings
pub const STORE_COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// Backend storing one JSON record per data key of a host ConfigMap.
///
/// A ConfigMap is capped at 1 MiB, which bounds a single store to a few
/// thousand mappings.
pub struct ConfigMapBackend {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapBackend {
    /// Backend on ConfigMap `name` in `namespace` of the given cluster
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }

    /// Create the ConfigMap if it does not exist yet
    pub async fn ensure(&self) -> Result<()> {
        if self.api.get_opt(&self.name).await?.is_some() {
            return Ok(());
        }
        self.create().await
    }

    async fn create(&self) -> Result<()> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(BTreeMap::from([
                    (
                        "app.kubernetes.io/managed-by".to_string(),
                        FIELD_MANAGER.to_string(),
                    ),
                    (STORE_COMPONENT_LABEL.to_string(), "mapping-store".to_string()),
                ])),
                ..Default::default()
            },
            data: Some(BTreeMap::new()),
            ..Default::default()
        };

        match self.api.create(&PostParams::default(), &cm).await {
            Ok(_) => {
                info!(configmap = %self.name, "created mapping store ConfigMap");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge-patch a single data key; `null` removes it
    async fn patch_key(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut data = serde_json::Map::new();
        data.insert(key.to_string(), value);
        let patch = json!({ "data": data });
        self.api
            .patch(
                &self.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MappingBackend for ConfigMapBackend {
    async fn load(&self) -> Result<Vec<Mapping>> {
        let Some(cm) = self.api.get_opt(&self.name).await? else {
            debug!(configmap = %self.name, "mapping store ConfigMap absent, starting empty");
            return Ok(Vec::new());
        };

        let mut mappings = Vec::new();
        for (key, value) in cm.data.unwrap_or_default() {
            let mapping: Mapping = match serde_json::from_str(&value) {
                Ok(m) => m,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping malformed mapping record");
                    continue;
                }
            };
            if mapping.storage_key() != key {
                warn!(
                    key = %key,
                    virtual = %mapping.virtual_identity,
                    "skipping mapping record stored under a foreign key"
                );
                continue;
            }
            mappings.push(mapping);
        }
        Ok(mappings)
    }

    async fn put(&self, mapping: &Mapping) -> Result<()> {
        let key = mapping.storage_key();
        let value = serde_json::to_string(mapping).map_err(|e| {
            Error::serialization_for_kind(&mapping.resource_kind, e.to_string())
        })?;

        match self.patch_key(&key, json!(value)).await {
            Err(e) if e.is_not_found() => {
                // Store ConfigMap was deleted underneath us
                self.create().await?;
                self.patch_key(&key, json!(value)).await
            }
            other => other,
        }
    }

    async fn remove(&self, virtual_identity: &ObjectIdentity) -> Result<()> {
        let key = storage_key(virtual_identity);
        match self.patch_key(&key, serde_json::Value::Null).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}
