//! In-memory store, resolver and CNF client for exercising the reconciler
//! without a cluster.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::json;

use crate::clients::{RemoteClient, RemoteError};
use crate::crd::{ResourceId, SdewanResource};
use crate::model::{ConfigKind, WanConfig};
use crate::reconciler::sweep::Op;
use crate::resolver::{BackendInstance, InstanceResolver, ResolveError, TargetGroup};
use crate::store::{ResourceStore, StoreError};
use crate::util::NFN_NETWORK_ANNOTATION;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Target group with the given `(network, interface)` attachments and one
/// replica per address (pods named `cnf-0`, `cnf-1`, ...).
pub fn cnf_group(networks: &[(&str, &str)], addresses: &[&str]) -> TargetGroup {
    let interfaces: Vec<_> = networks
        .iter()
        .map(|(name, iface)| json!({ "defaultGateway": "false", "interface": iface, "name": name }))
        .collect();
    let annotation = json!({ "type": "ovn4nfv", "interface": interfaces }).to_string();

    TargetGroup {
        deployment: "cnf".to_string(),
        annotations: BTreeMap::from([(NFN_NETWORK_ANNOTATION.to_string(), annotation)]),
        instances: addresses
            .iter()
            .enumerate()
            .filter_map(|(i, addr)| {
                let address: IpAddr = addr.parse().ok()?;
                Some(BackendInstance::new(format!("cnf-{}", i), address))
            })
            .collect(),
    }
}

/// Store keeping objects in memory with API-server-like semantics:
/// every write bumps `resourceVersion`, `update` leaves status alone and a
/// deleting object without finalizers is purged.
pub struct FakeStore<K> {
    objects: Mutex<BTreeMap<ResourceId, K>>,
    version: AtomicU64,
    fail_get: AtomicBool,
    fail_update: AtomicBool,
    fail_update_status: AtomicBool,
    updates: AtomicUsize,
    status_updates: AtomicUsize,
}

impl<K: SdewanResource> Default for FakeStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            fail_get: AtomicBool::new(false),
            fail_update: AtomicBool::new(false),
            fail_update_status: AtomicBool::new(false),
            updates: AtomicUsize::new(0),
            status_updates: AtomicUsize::new(0),
        }
    }
}

impl<K: SdewanResource> FakeStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Store `obj` (namespace defaults to `default`) and return its id.
    pub fn insert(&self, mut obj: K) -> ResourceId {
        if obj.namespace().is_none() {
            obj.meta_mut().namespace = Some("default".to_string());
        }
        obj.meta_mut().resource_version = Some(self.next_version());
        let id = ResourceId::from_resource(&obj);
        lock(&self.objects).insert(id.clone(), obj);
        id
    }

    pub fn object(&self, id: &ResourceId) -> Option<K> {
        lock(&self.objects).get(id).cloned()
    }

    /// Set the deletion marker, purging right away if no finalizer is left.
    pub fn mark_deleted(&self, id: &ResourceId) {
        let mut objects = lock(&self.objects);
        let Some(obj) = objects.get_mut(id) else {
            return;
        };
        obj.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        if obj.finalizers().is_empty() {
            objects.remove(id);
        }
    }

    pub fn fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    pub fn fail_update_status(&self, fail: bool) {
        self.fail_update_status.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn status_updates(&self) -> usize {
        self.status_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K: SdewanResource> ResourceStore<K> for FakeStore<K> {
    async fn get(&self, id: &ResourceId) -> Result<Option<K>, StoreError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(StoreError::Internal("injected get failure".to_string()));
        }
        Ok(self.object(id))
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(StoreError::Internal("injected update failure".to_string()));
        }
        let id = ResourceId::from_resource(obj);
        let mut objects = lock(&self.objects);
        let Some(current) = objects.get(&id) else {
            return Err(StoreError::Internal(format!("{} does not exist", id)));
        };
        if current.resource_version() != obj.resource_version() {
            return Err(StoreError::Conflict(id.to_string()));
        }

        let mut stored = obj.clone();
        if let Some(status) = current.status().cloned() {
            *stored.status_mut() = status;
        }
        stored.meta_mut().resource_version = Some(self.next_version());
        self.updates.fetch_add(1, Ordering::SeqCst);

        if stored.is_deleting() && stored.finalizers().is_empty() {
            objects.remove(&id);
        } else {
            objects.insert(id, stored.clone());
        }
        Ok(stored)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        if self.fail_update_status.load(Ordering::SeqCst) {
            return Err(StoreError::Internal("injected status failure".to_string()));
        }
        let id = ResourceId::from_resource(obj);
        let mut objects = lock(&self.objects);
        let Some(current) = objects.get_mut(&id) else {
            return Err(StoreError::Internal(format!("{} does not exist", id)));
        };
        *current.status_mut() = obj.status().cloned().unwrap_or_default();
        current.meta_mut().resource_version = Some(self.next_version());
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        Ok(current.clone())
    }
}

/// How the fake resolver should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveFailure {
    Lookup,
    Ambiguous,
}

/// Resolver answering from a fixed purpose -> group table.
#[derive(Default)]
pub struct FakeResolver {
    groups: Mutex<HashMap<String, TargetGroup>>,
    failure: Mutex<Option<ResolveFailure>>,
    calls: AtomicUsize,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(self, purpose: &str, group: TargetGroup) -> Self {
        self.set_group(purpose, group);
        self
    }

    pub fn set_group(&self, purpose: &str, group: TargetGroup) {
        lock(&self.groups).insert(purpose.to_string(), group);
    }

    pub fn remove_group(&self, purpose: &str) {
        lock(&self.groups).remove(purpose);
    }

    pub fn fail(&self, failure: Option<ResolveFailure>) {
        *lock(&self.failure) = failure;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceResolver for FakeResolver {
    async fn resolve(
        &self,
        _namespace: &str,
        purpose: &str,
    ) -> Result<Option<TargetGroup>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *lock(&self.failure) {
            Some(ResolveFailure::Lookup) => {
                return Err(ResolveError::Lookup("injected lookup failure".to_string()));
            }
            Some(ResolveFailure::Ambiguous) => {
                return Err(ResolveError::Ambiguous {
                    purpose: purpose.to_string(),
                    count: 2,
                });
            }
            None => {}
        }
        Ok(lock(&self.groups).get(purpose).cloned())
    }
}

/// A call received by [`RecordingRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub op: Op,
    pub address: IpAddr,
    /// Object name, or the service name for restarts.
    pub name: String,
}

/// CNF client keeping per-replica objects in memory and recording calls.
#[derive(Default)]
pub struct RecordingRemote {
    objects: Mutex<HashMap<(IpAddr, ConfigKind, String), WanConfig>>,
    calls: Mutex<Vec<RemoteCall>>,
    failures: Mutex<Vec<(IpAddr, Op)>>,
}

impl RecordingRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a replica with an object.
    pub fn seed(&self, address: IpAddr, config: WanConfig) {
        lock(&self.objects).insert((address, config.kind(), config.name().to_string()), config);
    }

    pub fn object(&self, address: IpAddr, kind: ConfigKind, name: &str) -> Option<WanConfig> {
        lock(&self.objects)
            .get(&(address, kind, name.to_string()))
            .cloned()
    }

    /// Make `op` on `address` fail from now on.
    pub fn fail_on(&self, address: IpAddr, op: Op) {
        lock(&self.failures).push((address, op));
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn count(&self, op: Op) -> usize {
        lock(&self.calls).iter().filter(|c| c.op == op).count()
    }

    /// Calls made against one replica.
    pub fn calls_to(&self, address: IpAddr) -> Vec<Op> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.address == address)
            .map(|c| c.op)
            .collect()
    }

    fn record(&self, op: Op, address: IpAddr, name: &str) -> Result<(), RemoteError> {
        lock(&self.calls).push(RemoteCall {
            op,
            address,
            name: name.to_string(),
        });
        if lock(&self.failures).contains(&(address, op)) {
            return Err(RemoteError::Other(format!("injected {} failure on {}", op, address)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for RecordingRemote {
    async fn get(
        &self,
        instance: &BackendInstance,
        kind: ConfigKind,
        name: &str,
    ) -> Result<Option<WanConfig>, RemoteError> {
        self.record(Op::Get, instance.address, name)?;
        Ok(self.object(instance.address, kind, name))
    }

    async fn create(
        &self,
        instance: &BackendInstance,
        config: &WanConfig,
    ) -> Result<(), RemoteError> {
        self.record(Op::Create, instance.address, config.name())?;
        self.seed(instance.address, config.clone());
        Ok(())
    }

    async fn update(
        &self,
        instance: &BackendInstance,
        config: &WanConfig,
    ) -> Result<(), RemoteError> {
        self.record(Op::Update, instance.address, config.name())?;
        self.seed(instance.address, config.clone());
        Ok(())
    }

    async fn delete(
        &self,
        instance: &BackendInstance,
        kind: ConfigKind,
        name: &str,
    ) -> Result<(), RemoteError> {
        self.record(Op::Delete, instance.address, name)?;
        lock(&self.objects).remove(&(instance.address, kind, name.to_string()));
        Ok(())
    }

    async fn restart(&self, instance: &BackendInstance, service: &str) -> Result<bool, RemoteError> {
        self.record(Op::Restart, instance.address, service)?;
        Ok(true)
    }
}
