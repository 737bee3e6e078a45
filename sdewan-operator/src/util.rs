//! Small helpers shared by the reconciler and the type handlers.

use std::collections::BTreeMap;

use kube::ResourceExt;
use serde::Deserialize;

use crate::handler::ConversionError;

/// Pod-template annotation describing the CNF's attached networks.
pub const NFN_NETWORK_ANNOTATION: &str = "k8s.plugin.opnfv.org/nfn-network";

/// Check whether `slice` contains `s`.
pub fn contains_string(slice: &[String], s: &str) -> bool {
    slice.iter().any(|item| item == s)
}

/// Return `slice` without any occurrence of `s`, preserving order.
pub fn remove_string(slice: &[String], s: &str) -> Vec<String> {
    slice.iter().filter(|item| *item != s).cloned().collect()
}

pub fn has_finalizer<K: ResourceExt>(obj: &K, token: &str) -> bool {
    contains_string(obj.finalizers(), token)
}

/// Append `token` unless already present. Returns true if the object changed.
pub fn add_finalizer<K: ResourceExt>(obj: &mut K, token: &str) -> bool {
    if has_finalizer(obj, token) {
        return false;
    }
    obj.finalizers_mut().push(token.to_string());
    true
}

/// Drop `token` from the finalizers. Returns true if the object changed.
pub fn remove_finalizer<K: ResourceExt>(obj: &mut K, token: &str) -> bool {
    if !has_finalizer(obj, token) {
        return false;
    }
    let remaining = remove_string(obj.finalizers(), token);
    *obj.finalizers_mut() = remaining;
    true
}

#[derive(Debug, Deserialize)]
struct NfnNetwork {
    #[serde(default, alias = "Interface")]
    interface: Vec<NfnInterface>,
}

#[derive(Debug, Deserialize)]
struct NfnInterface {
    #[serde(alias = "Interface")]
    interface: String,
    #[serde(alias = "Name")]
    name: String,
}

/// Resolve a logical network name to the CNF interface carrying it.
///
/// `annotations` are the pod-template annotations of the CNF deployment.
pub fn net_to_iface(
    net: &str,
    deployment: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<String, ConversionError> {
    let raw = annotations
        .get(NFN_NETWORK_ANNOTATION)
        .ok_or_else(|| ConversionError::MissingAnnotation(deployment.to_string()))?;

    let nfn: NfnNetwork =
        serde_json::from_str(raw).map_err(|source| ConversionError::MalformedAnnotation {
            deployment: deployment.to_string(),
            source,
        })?;

    nfn.interface
        .into_iter()
        .find(|iface| iface.name == net)
        .map(|iface| iface.interface)
        .ok_or_else(|| ConversionError::UnknownNetwork {
            network: net.to_string(),
            deployment: deployment.to_string(),
        })
}
