//! Clients for the configuration API running on each CNF replica.
//!
//! - openwrt: LuCI/sdewan REST API of the OpenWrt based CNF

pub mod openwrt;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ConfigKind, WanConfig};
use crate::resolver::BackendInstance;

pub use openwrt::{CnfCredentials, OpenWrtClient};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("login to {0} failed: no session cookie")]
    Login(String),

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Per-instance configuration operations.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch a named object; `Ok(None)` if the replica does not have it.
    async fn get(
        &self,
        instance: &BackendInstance,
        kind: ConfigKind,
        name: &str,
    ) -> Result<Option<WanConfig>, RemoteError>;

    async fn create(&self, instance: &BackendInstance, config: &WanConfig)
        -> Result<(), RemoteError>;

    async fn update(&self, instance: &BackendInstance, config: &WanConfig)
        -> Result<(), RemoteError>;

    async fn delete(
        &self,
        instance: &BackendInstance,
        kind: ConfigKind,
        name: &str,
    ) -> Result<(), RemoteError>;

    /// Restart a service so it picks up new configuration.
    /// Returns whether the replica reported a change.
    async fn restart(&self, instance: &BackendInstance, service: &str)
        -> Result<bool, RemoteError>;
}
