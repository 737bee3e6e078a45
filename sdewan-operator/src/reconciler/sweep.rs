//! Per-replica sweeps. Replicas are visited one at a time in discovery order
//! and the first failing call aborts the sweep. Replicas already changed are
//! left as they are.

use std::fmt;

use tracing::{debug, info};

use crate::clients::RemoteError;
use crate::handler::TypeHandler;
use crate::model::WanConfig;
use crate::resolver::BackendInstance;

/// Remote operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Create,
    Update,
    Delete,
    Restart,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Get => "get",
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
            Op::Restart => "restart",
        };
        f.write_str(s)
    }
}

/// A sweep aborted on `instance`.
#[derive(Debug)]
pub struct SweepError {
    pub instance: BackendInstance,
    pub op: Op,
    pub source: RemoteError,
    /// Whether any replica was changed before the abort.
    pub changed: bool,
}

impl fmt::Display for SweepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} failed: {}", self.op, self.instance, self.source)
    }
}

impl std::error::Error for SweepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Bring every replica to `desired`. Returns whether any replica changed.
pub async fn converge<H: TypeHandler>(
    handler: &H,
    instances: &[BackendInstance],
    desired: &WanConfig,
) -> Result<bool, SweepError> {
    let mut changed = false;

    for instance in instances {
        let fail = |op, source| SweepError {
            instance: instance.clone(),
            op,
            source,
            changed,
        };

        let current = handler
            .fetch_remote(instance, desired.name())
            .await
            .map_err(|e| fail(Op::Get, e))?;

        let instance_changed = match current {
            None => {
                handler
                    .create_remote(instance, desired)
                    .await
                    .map_err(|e| fail(Op::Create, e))?;
                true
            }
            Some(current) if handler.equal(&current, desired) => {
                debug!("{} on {} is up to date", desired.name(), instance);
                false
            }
            Some(_) => {
                handler
                    .update_remote(instance, desired)
                    .await
                    .map_err(|e| fail(Op::Update, e))?;
                true
            }
        };

        if instance_changed {
            // Count the replica as changed before restarting so an aborted
            // restart still reports the mutation.
            changed = true;
            let restarted = handler.restart(instance).await.map_err(|e| SweepError {
                instance: instance.clone(),
                op: Op::Restart,
                source: e,
                changed,
            })?;
            info!(
                "Applied {} to {} (service restarted: {})",
                desired.name(),
                instance,
                restarted
            );
        }
    }

    Ok(changed)
}

/// Remove `name` from every replica. Returns whether any replica changed.
pub async fn delete<H: TypeHandler>(
    handler: &H,
    instances: &[BackendInstance],
    name: &str,
) -> Result<bool, SweepError> {
    let mut changed = false;

    for instance in instances {
        let fail = |op, source| SweepError {
            instance: instance.clone(),
            op,
            source,
            changed,
        };

        let current = handler
            .fetch_remote(instance, name)
            .await
            .map_err(|e| fail(Op::Get, e))?;
        if current.is_none() {
            debug!("{} not present on {}, nothing to delete", name, instance);
            continue;
        }

        handler
            .delete_remote(instance, name)
            .await
            .map_err(|e| fail(Op::Delete, e))?;
        changed = true;
        handler.restart(instance).await.map_err(|e| SweepError {
            instance: instance.clone(),
            op: Op::Restart,
            source: e,
            changed,
        })?;
        info!("Removed {} from {}", name, instance);
    }

    Ok(changed)
}
