//! Generic reconciliation engine.
//!
//! One call to [`reconcile`] handles one event for one resource identity:
//! fetch the desired resource, resolve its target group, then either converge
//! every replica (active resource) or clean every replica up (deleting
//! resource). The finalizer and status block are written back through the
//! store.
//!
//! States:
//! - Active: no deletion marker. Converge, keep the finalizer, report status.
//! - Deleting: deletion marker and our finalizer. Clean up, drop the finalizer.
//! - Gone: deletion marker without our finalizer. Nothing left to do; the API
//!   server purges the object.

pub mod lock;
pub mod sweep;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::crd::{ResourceId, SdewanResource};
use crate::handler::TypeHandler;
use crate::resolver::{InstanceResolver, ResolveError, TargetGroup};
use crate::store::{ResourceStore, StoreError};
use crate::util::{add_finalizer, has_finalizer, remove_finalizer};

pub use lock::KeyedLocks;

/// Delay before a failed attempt is retried.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// What the caller should do after a reconcile attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged (or nothing to do); wait for the next change.
    Done,
    /// Run the whole reconcile again after the delay.
    RequeueAfter(Duration),
}

/// Hard failures: the finalizer or status could not be persisted.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to persist finalizer of {id}: {source}")]
    Finalizer {
        id: ResourceId,
        #[source]
        source: StoreError,
    },

    #[error("failed to persist status of {id}: {source}")]
    Status {
        id: ResourceId,
        #[source]
        source: StoreError,
    },
}

/// Everything a reconcile of kind `H` needs.
pub struct Context<H: TypeHandler> {
    pub handler: H,
    pub store: Arc<dyn ResourceStore<H::Resource>>,
    pub resolver: Arc<dyn InstanceResolver>,
    pub retry_delay: Duration,
    locks: KeyedLocks,
}

impl<H: TypeHandler> Context<H> {
    pub fn new(
        handler: H,
        store: Arc<dyn ResourceStore<H::Resource>>,
        resolver: Arc<dyn InstanceResolver>,
    ) -> Self {
        Self {
            handler,
            store,
            resolver,
            retry_delay: RETRY_DELAY,
            locks: KeyedLocks::new(),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn requeue(&self) -> Outcome {
        Outcome::RequeueAfter(self.retry_delay)
    }
}

/// Reconcile one resource identity.
///
/// Concurrent calls for the same identity are serialized; distinct
/// identities run in parallel.
pub async fn reconcile<H: TypeHandler>(
    ctx: &Context<H>,
    id: &ResourceId,
) -> Result<Outcome, ReconcileError> {
    let span = info_span!(
        "reconcile",
        kind = ctx.handler.kind(),
        namespace = %id.namespace,
        name = %id.name
    );

    async {
        let _guard = ctx.locks.lock(&id.to_string()).await;
        process(ctx, id).await
    }
    .instrument(span)
    .await
}

async fn process<H: TypeHandler>(
    ctx: &Context<H>,
    id: &ResourceId,
) -> Result<Outcome, ReconcileError> {
    let handler = &ctx.handler;

    let resource = match handler.fetch_desired(ctx.store.as_ref(), id).await {
        Ok(Some(resource)) => resource,
        Ok(None) => {
            debug!("{} {} not found, nothing to do", handler.kind(), id);
            return Ok(Outcome::Done);
        }
        Err(e) => {
            warn!("Failed to read {} {}: {}", handler.kind(), id, e);
            return Ok(ctx.requeue());
        }
    };

    let group = match resource.purpose() {
        None => None,
        Some(purpose) => match ctx.resolver.resolve(&id.namespace, purpose).await {
            Ok(group) => group.filter(|g| !g.instances.is_empty()),
            Err(e @ ResolveError::Ambiguous { .. }) => {
                // A new event arrives once the deployment set changes
                error!("Cannot resolve CNF for {} {}: {}", handler.kind(), id, e);
                return Ok(Outcome::Done);
            }
            Err(e) => {
                warn!("Failed to resolve CNF for {} {}: {}", handler.kind(), id, e);
                return Ok(ctx.requeue());
            }
        },
    };

    if resource.is_deleting() {
        finalize(ctx, id, resource, group).await
    } else {
        apply(ctx, id, resource, group).await
    }
}

/// Active resource: converge every replica, then record finalizer and status.
async fn apply<H: TypeHandler>(
    ctx: &Context<H>,
    id: &ResourceId,
    mut resource: H::Resource,
    group: Option<TargetGroup>,
) -> Result<Outcome, ReconcileError> {
    let handler = &ctx.handler;

    let Some(group) = group else {
        info!("No CNF exists, so not create/update {} {}", handler.kind(), id);
        return Ok(Outcome::Done);
    };

    let desired = match handler.convert(&resource, &group) {
        Ok(desired) => desired,
        Err(e) => {
            warn!("Failed to convert {} {}: {}", handler.kind(), id, e);
            return Ok(ctx.requeue());
        }
    };

    // Finalizer must be persisted before any replica is touched
    if add_finalizer(&mut resource, handler.finalizer()) {
        info!("Adding finalizer for {} {}", handler.kind(), id);
        resource = ctx
            .store
            .update(&resource)
            .await
            .map_err(|source| ReconcileError::Finalizer {
                id: id.clone(),
                source,
            })?;
    }

    let changed = match sweep::converge(handler, &group.instances, &desired).await {
        Ok(changed) => changed,
        Err(e) => {
            error!(
                "Failed to add/update {} {} on {} (changed before abort: {}): {}",
                handler.kind(),
                id,
                group.deployment,
                e.changed,
                e
            );
            return Ok(ctx.requeue());
        }
    };

    if changed {
        let version = resource.resource_version();
        let status = resource.status_mut();
        status.applied_version = version;
        status.applied_time = Some(Utc::now());
        status.in_sync = true;
        ctx.store
            .update_status(&resource)
            .await
            .map_err(|source| ReconcileError::Status {
                id: id.clone(),
                source,
            })?;
        info!(
            "{} {} applied to {} replicas of {}",
            handler.kind(),
            id,
            group.instances.len(),
            group.deployment
        );
    }

    Ok(Outcome::Done)
}

/// Deleting resource: remove it from every replica, then drop the finalizer.
async fn finalize<H: TypeHandler>(
    ctx: &Context<H>,
    id: &ResourceId,
    mut resource: H::Resource,
    group: Option<TargetGroup>,
) -> Result<Outcome, ReconcileError> {
    let handler = &ctx.handler;

    if !has_finalizer(&resource, handler.finalizer()) {
        debug!("{} {} already finalized", handler.kind(), id);
        return Ok(Outcome::Done);
    }

    if let Some(group) = group {
        let name = handler.identity(&resource);
        if let Err(e) = sweep::delete(handler, &group.instances, &name).await {
            error!(
                "Failed to delete {} {} from {} (changed before abort: {}): {}",
                handler.kind(),
                id,
                group.deployment,
                e.changed,
                e
            );
            return Ok(ctx.requeue());
        }
    } else {
        info!("No CNF exists for {} {}, nothing to clean up", handler.kind(), id);
    }

    remove_finalizer(&mut resource, handler.finalizer());
    info!("Removing finalizer for {} {}", handler.kind(), id);
    ctx.store
        .update(&resource)
        .await
        .map_err(|source| ReconcileError::Finalizer {
            id: id.clone(),
            source,
        })?;

    Ok(Outcome::Done)
}
