//! Client for the OpenWrt CNF configuration API.
//!
//! Every request goes to `http://<pod-ip>:<port>/cgi-bin/luci/<path>` and is
//! authenticated with the LuCI `sysauth` session cookie obtained by posting
//! the credentials to the LuCI root.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Method, StatusCode};
use serde_json::json;
use tracing::debug;

use super::{RemoteClient, RemoteError};
use crate::model::{ConfigKind, WanConfig};
use crate::resolver::BackendInstance;

/// Credentials and port the CNF image ships with.
#[derive(Debug, Clone)]
pub struct CnfCredentials {
    pub username: String,
    pub password: String,
    pub port: u16,
}

impl Default for CnfCredentials {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: String::new(),
            port: 80,
        }
    }
}

/// REST client for OpenWrt based CNF replicas.
pub struct OpenWrtClient {
    http: reqwest::Client,
    credentials: CnfCredentials,
    /// LuCI session cookies per replica address. Never held across a request;
    /// an entry is dropped as soon as the replica rejects or stops answering.
    sessions: Mutex<HashMap<IpAddr, String>>,
}

impl OpenWrtClient {
    pub fn new(credentials: CnfCredentials, timeout: Duration) -> Result<Self, RemoteError> {
        // LuCI answers a successful login with a redirect carrying the cookie
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            credentials,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn base_url(&self, instance: &BackendInstance) -> String {
        format!(
            "http://{}/cgi-bin/luci/",
            SocketAddr::new(instance.address, self.credentials.port)
        )
    }

    async fn login(&self, instance: &BackendInstance) -> Result<String, RemoteError> {
        debug!("Logging in to CNF {}", instance);
        let resp = self
            .http
            .post(self.base_url(instance))
            .form(&[
                ("luci_username", self.credentials.username.as_str()),
                ("luci_password", self.credentials.password.as_str()),
            ])
            .send()
            .await?;

        resp.headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("sysauth"))
            .and_then(|v| v.split(';').next())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Login(instance.to_string()))
    }

    fn cached_session(&self, address: IpAddr) -> Option<String> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }

    fn store_session(&self, address: IpAddr, cookie: String) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, cookie);
    }

    fn forget_session(&self, address: IpAddr) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
    }

    async fn session(&self, instance: &BackendInstance, fresh: bool) -> Result<String, RemoteError> {
        if !fresh {
            if let Some(cookie) = self.cached_session(instance.address) {
                return Ok(cookie);
            }
        }
        // Concurrent first calls to one replica may both log in; the last cookie wins
        match self.login(instance).await {
            Ok(cookie) => {
                self.store_session(instance.address, cookie.clone());
                Ok(cookie)
            }
            Err(e) => {
                self.forget_session(instance.address);
                Err(e)
            }
        }
    }

    /// Issue a request. `Ok(None)` means the replica answered 404.
    async fn call(
        &self,
        instance: &BackendInstance,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        let url = format!("{}{}", self.base_url(instance), path);

        let mut fresh = false;
        loop {
            let cookie = self.session(instance, fresh).await?;
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header(COOKIE, cookie);
            if let Some(body) = &body {
                req = req.json(body);
            }
            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    // Unreachable replicas are usually rescheduled under a new address
                    self.forget_session(instance.address);
                    return Err(e.into());
                }
            };
            let status = resp.status();

            // Session expired or replica restarted: log in again once
            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                if !fresh {
                    fresh = true;
                    continue;
                }
                self.forget_session(instance.address);
            }
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(RemoteError::Status {
                    method: method.to_string(),
                    url,
                    status: status.as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                });
            }
            return Ok(Some(resp.bytes().await?.to_vec()));
        }
    }

    /// Like [`call`](Self::call) but a 404 is an error.
    async fn call_existing(
        &self,
        instance: &BackendInstance,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), RemoteError> {
        match self.call(instance, method.clone(), path, body).await? {
            Some(_) => Ok(()),
            None => Err(RemoteError::Status {
                method: method.to_string(),
                url: format!("{}{}", self.base_url(instance), path),
                status: StatusCode::NOT_FOUND.as_u16(),
                body: String::new(),
            }),
        }
    }
}

fn object_path(kind: ConfigKind, name: &str) -> String {
    format!("sdewan/mwan3/v1/{}/{}", kind.collection(), name)
}

fn collection_path(kind: ConfigKind) -> String {
    format!("sdewan/mwan3/v1/{}", kind.collection())
}

#[async_trait]
impl RemoteClient for OpenWrtClient {
    async fn get(
        &self,
        instance: &BackendInstance,
        kind: ConfigKind,
        name: &str,
    ) -> Result<Option<WanConfig>, RemoteError> {
        match self
            .call(instance, Method::GET, &object_path(kind, name), None)
            .await?
        {
            Some(body) => Ok(Some(WanConfig::from_json(kind, &body)?)),
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        instance: &BackendInstance,
        config: &WanConfig,
    ) -> Result<(), RemoteError> {
        debug!("Creating {} {} on {}", config.kind(), config.name(), instance);
        self.call_existing(
            instance,
            Method::POST,
            &collection_path(config.kind()),
            Some(config.to_json()?),
        )
        .await
    }

    async fn update(
        &self,
        instance: &BackendInstance,
        config: &WanConfig,
    ) -> Result<(), RemoteError> {
        debug!("Updating {} {} on {}", config.kind(), config.name(), instance);
        self.call_existing(
            instance,
            Method::PUT,
            &object_path(config.kind(), config.name()),
            Some(config.to_json()?),
        )
        .await
    }

    async fn delete(
        &self,
        instance: &BackendInstance,
        kind: ConfigKind,
        name: &str,
    ) -> Result<(), RemoteError> {
        debug!("Deleting {} {} on {}", kind, name, instance);
        // Already gone counts as deleted
        self.call(instance, Method::DELETE, &object_path(kind, name), None)
            .await?;
        Ok(())
    }

    /// The service endpoint acknowledges with a bare success status and does
    /// not report whether the daemon state changed, so an accepted restart
    /// always counts as a change.
    async fn restart(&self, instance: &BackendInstance, service: &str) -> Result<bool, RemoteError> {
        debug!("Restarting {} on {}", service, instance);
        self.call_existing(
            instance,
            Method::PUT,
            "sdewan/v1/service",
            Some(json!({ "name": service, "action": "restart" })),
        )
        .await?;
        Ok(true)
    }
}
