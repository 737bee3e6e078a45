//! Access to desired-state resources in the Kubernetes API server.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use thiserror::Error;

use crate::crd::{ResourceId, SdewanResource};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    /// Object changed since it was read (optimistic concurrency control).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal: {0}")]
    Internal(String),
}

/// Get/update primitives the reconciler uses on desired resources.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// `Ok(None)` if the resource no longer exists.
    async fn get(&self, id: &ResourceId) -> Result<Option<K>, StoreError>;

    /// Persist metadata and spec (finalizers included). Returns the stored object.
    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Persist the status subresource only. Returns the stored object.
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;
}

/// Store backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<K: SdewanResource> ResourceStore<K> for KubeStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<K>, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &id.namespace);
        Ok(api.get_opt(&id.name).await?)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let id = ResourceId::from_resource(obj);
        let api: Api<K> = Api::namespaced(self.client.clone(), &id.namespace);
        match api.replace(&id.name, &PostParams::default(), obj).await {
            Ok(stored) => Ok(stored),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(StoreError::Conflict(format!(
                "{} changed since read (resourceVersion {})",
                id,
                obj.resource_version().unwrap_or_default()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let id = ResourceId::from_resource(obj);
        let api: Api<K> = Api::namespaced(self.client.clone(), &id.namespace);
        let patch = json!({ "status": obj.status() });
        Ok(api
            .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
