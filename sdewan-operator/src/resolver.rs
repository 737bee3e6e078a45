//! Instance resolver - maps a purpose label to the CNF replicas serving it.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::crd::PURPOSE_LABEL;

/// One CNF replica exposing the configuration API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInstance {
    pub pod: String,
    pub address: IpAddr,
}

impl BackendInstance {
    pub fn new(pod: impl Into<String>, address: IpAddr) -> Self {
        Self {
            pod: pod.into(),
            address,
        }
    }
}

impl fmt::Display for BackendInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.pod, self.address)
    }
}

/// The CNF deployment for a purpose and its current replicas.
#[derive(Debug, Clone, Default)]
pub struct TargetGroup {
    pub deployment: String,
    /// Pod-template annotations of the deployment (network attachment info).
    pub annotations: BTreeMap<String, String>,
    /// Replicas in discovery order.
    pub instances: Vec<BackendInstance>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error("{count} deployments match purpose {purpose}, expected one")]
    Ambiguous { purpose: String, count: usize },

    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// Discovery of the target group behind a purpose.
///
/// Called on every reconcile; implementations must not cache across calls.
#[async_trait]
pub trait InstanceResolver: Send + Sync {
    /// `Ok(None)` means no CNF currently serves `purpose`.
    async fn resolve(
        &self,
        namespace: &str,
        purpose: &str,
    ) -> Result<Option<TargetGroup>, ResolveError>;
}

/// Resolver backed by Deployments and Pods labelled `sdewanPurpose`.
pub struct KubeResolver {
    client: Client,
}

impl KubeResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InstanceResolver for KubeResolver {
    async fn resolve(
        &self,
        namespace: &str,
        purpose: &str,
    ) -> Result<Option<TargetGroup>, ResolveError> {
        let selector = format!("{}={}", PURPOSE_LABEL, purpose);
        let params = ListParams::default().labels(&selector);

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let mut found = deployments.list(&params).await?.items;
        let deployment = match found.len() {
            0 => {
                debug!("No CNF deployment for purpose {} in {}", purpose, namespace);
                return Ok(None);
            }
            1 => found.remove(0),
            count => {
                return Err(ResolveError::Ambiguous {
                    purpose: purpose.to_string(),
                    count,
                });
            }
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = pods.list(&params).await?.items;
        target_group(&deployment, &pods).map(Some)
    }
}

/// Build the group from the purpose's deployment and its pods.
fn target_group(deployment: &Deployment, pods: &[Pod]) -> Result<TargetGroup, ResolveError> {
    let name = deployment.name_any();
    let spec = deployment
        .spec
        .as_ref()
        .ok_or_else(|| ResolveError::Lookup(format!("deployment {} has no spec", name)))?;
    let annotations = spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default();

    Ok(TargetGroup {
        deployment: name,
        annotations,
        instances: pods.iter().filter_map(pod_instance).collect(),
    })
}

/// Usable instance for a pod, if it is running with an address.
fn pod_instance(pod: &Pod) -> Option<BackendInstance> {
    let name = pod.name_any();
    if pod.metadata.deletion_timestamp.is_some() {
        debug!("Skipping terminating CNF pod {}", name);
        return None;
    }
    let ip = pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())?;
    match ip.parse() {
        Ok(address) => Some(BackendInstance::new(name, address)),
        Err(_) => {
            warn!("CNF pod {} has unparsable IP {}", name, ip);
            None
        }
    }
}
