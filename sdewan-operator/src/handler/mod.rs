//! Type handlers: everything kind-specific about a desired resource.
//!
//! The reconciler is generic over [`TypeHandler`]. A handler knows how to
//! fetch its resource, turn the spec into a [`WanConfig`] and drive the
//! per-replica configuration calls.

pub mod policy;
pub mod rule;

use async_trait::async_trait;
use kube::ResourceExt;
use thiserror::Error;

use crate::clients::{RemoteClient, RemoteError};
use crate::crd::{ResourceId, SdewanResource, FINALIZER};
use crate::model::{ConfigKind, WanConfig};
use crate::resolver::{BackendInstance, TargetGroup};
use crate::store::{ResourceStore, StoreError};

pub use policy::PolicyHandler;
pub use rule::RuleHandler;

/// Service consuming mwan3 configuration on the CNF.
pub const MWAN3_SERVICE: &str = "mwan3";

/// Spec could not be turned into a configuration object.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("deployment {0} has no network annotation")]
    MissingAnnotation(String),

    #[error("deployment {deployment} has a malformed network annotation: {source}")]
    MalformedAnnotation {
        deployment: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no network {network} in deployment {deployment}")]
    UnknownNetwork { network: String, deployment: String },

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Kind-specific capability set used by the reconciler.
#[async_trait]
pub trait TypeHandler: Send + Sync + 'static {
    type Resource: SdewanResource;

    /// Kind name used in logs.
    fn kind(&self) -> &'static str;

    fn config_kind(&self) -> ConfigKind;

    fn remote(&self) -> &dyn RemoteClient;

    /// Name of the remote object managed for `resource`.
    fn identity(&self, resource: &Self::Resource) -> String {
        resource.name_any()
    }

    fn finalizer(&self) -> &'static str {
        FINALIZER
    }

    async fn fetch_desired(
        &self,
        store: &dyn ResourceStore<Self::Resource>,
        id: &ResourceId,
    ) -> Result<Option<Self::Resource>, StoreError> {
        store.get(id).await
    }

    /// Build the configuration object. Fails as a whole if any part of the
    /// spec cannot be resolved against `group`.
    fn convert(
        &self,
        resource: &Self::Resource,
        group: &TargetGroup,
    ) -> Result<WanConfig, ConversionError>;

    fn equal(&self, a: &WanConfig, b: &WanConfig) -> bool {
        a == b
    }

    async fn fetch_remote(
        &self,
        instance: &BackendInstance,
        name: &str,
    ) -> Result<Option<WanConfig>, RemoteError> {
        self.remote().get(instance, self.config_kind(), name).await
    }

    async fn create_remote(
        &self,
        instance: &BackendInstance,
        config: &WanConfig,
    ) -> Result<(), RemoteError> {
        self.remote().create(instance, config).await
    }

    async fn update_remote(
        &self,
        instance: &BackendInstance,
        config: &WanConfig,
    ) -> Result<(), RemoteError> {
        self.remote().update(instance, config).await
    }

    async fn delete_remote(&self, instance: &BackendInstance, name: &str) -> Result<(), RemoteError> {
        self.remote().delete(instance, self.config_kind(), name).await
    }

    async fn restart(&self, instance: &BackendInstance) -> Result<bool, RemoteError> {
        self.remote().restart(instance, MWAN3_SERVICE).await
    }
}
