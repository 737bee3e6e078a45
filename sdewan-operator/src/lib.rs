//! sdewan-operator: keeps mwan3 routing policy converged across CNF replicas.
//!
//! Desired state lives in `Mwan3Policy` / `Mwan3Rule` custom resources. For
//! every change the reconciler resolves the CNF pods that serve the resource's
//! `sdewanPurpose`, converts the spec into a normalized mwan3 object and
//! pushes it to each replica through its configuration API.

pub mod clients;
pub mod controller;
pub mod crd;
pub mod handler;
pub mod model;
pub mod reconciler;
pub mod resolver;
pub mod store;
pub mod test_util;
pub mod util;

pub use crd::{Mwan3Policy, Mwan3Rule, SdewanResource, SdewanStatus};
pub use handler::{PolicyHandler, RuleHandler, TypeHandler};
pub use reconciler::{Context, Outcome, ReconcileError, RETRY_DELAY};
