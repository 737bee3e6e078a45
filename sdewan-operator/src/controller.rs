//! kube-runtime wiring: one controller per desired-state kind.
//!
//! Besides the custom resource itself, each controller watches CNF pods
//! labelled `sdewanPurpose` so a replica coming up (or being replaced)
//! triggers a reconcile of every resource bound to that purpose.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::{ResourceId, SdewanResource, PURPOSE_LABEL};
use crate::handler::TypeHandler;
use crate::reconciler::{self, Context, Outcome, ReconcileError};

async fn reconcile<H: TypeHandler>(
    obj: Arc<H::Resource>,
    ctx: Arc<Context<H>>,
) -> Result<Action, ReconcileError> {
    let id = ResourceId::from_resource(obj.as_ref());
    Ok(match reconciler::reconcile(&ctx, &id).await? {
        Outcome::Done => Action::await_change(),
        Outcome::RequeueAfter(delay) => Action::requeue(delay),
    })
}

fn error_policy<H: TypeHandler>(
    obj: Arc<H::Resource>,
    err: &ReconcileError,
    ctx: Arc<Context<H>>,
) -> Action {
    warn!(
        "Reconcile of {} {} failed: {}",
        ctx.handler.kind(),
        obj.name_any(),
        err
    );
    Action::requeue(ctx.retry_delay)
}

/// Resources of the watched kind sharing a CNF pod's namespace and purpose.
fn resources_for_pod<K: SdewanResource>(store: &Store<K>, pod: &Pod) -> Vec<ObjectRef<K>> {
    let Some(purpose) = pod.labels().get(PURPOSE_LABEL) else {
        return Vec::new();
    };
    let namespace = pod.namespace();
    store
        .state()
        .into_iter()
        .filter(|obj| obj.namespace() == namespace && obj.purpose() == Some(purpose.as_str()))
        .map(|obj| ObjectRef::from_obj(obj.as_ref()))
        .collect()
}

/// Run the controller for handler kind `H` until shutdown.
///
/// `namespace` limits the watch; `None` watches all namespaces.
pub async fn run<H: TypeHandler>(client: Client, namespace: Option<&str>, ctx: Arc<Context<H>>) {
    let (resources, pods): (Api<H::Resource>, Api<Pod>) = match namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client, ns),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    let kind = ctx.handler.kind();
    info!("Starting {} controller", kind);

    let controller = Controller::new(resources, watcher::Config::default());
    let store = controller.store();
    controller
        .watches(
            pods,
            watcher::Config::default().labels(PURPOSE_LABEL),
            move |pod| resources_for_pod(&store, &pod),
        )
        .shutdown_on_signal()
        .run(reconcile::<H>, error_policy::<H>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!("Reconciled {}: {:?}", obj, action),
                Err(e) => warn!("{} controller error: {}", kind, e),
            }
        })
        .await;

    info!("{} controller stopped", kind);
}
