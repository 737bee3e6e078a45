//! Custom resource definitions for the `batch.sdewan.akraino.org` group.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::core::NamespaceResourceScope;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Label binding a resource (and the CNF deployment/pods) to a target group.
pub const PURPOSE_LABEL: &str = "sdewanPurpose";

/// Finalizer token shared by all mwan3 kinds.
pub const FINALIZER: &str = "rule.finalizers.sdewan.akraino.org";

/// Status block written after a fully successful convergence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SdewanStatus {
    /// resourceVersion of the object that was last applied to every replica.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub in_sync: bool,
}

/// One WAN member of an mwan3 policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Mwan3PolicyMember {
    /// Logical network name, resolved to a CNF interface through the
    /// deployment's network annotation.
    pub network: String,
    pub metric: i32,
    pub weight: i32,
}

/// Mwan3Policy: ordered set of WAN members used for load balancing/failover.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "batch.sdewan.akraino.org",
    version = "v1alpha1",
    kind = "Mwan3Policy",
    plural = "mwan3policies",
    namespaced,
    status = "SdewanStatus"
)]
pub struct Mwan3PolicySpec {
    pub members: Vec<Mwan3PolicyMember>,
}

/// Mwan3Rule: traffic match criteria steering packets into a policy.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "batch.sdewan.akraino.org",
    version = "v1alpha1",
    kind = "Mwan3Rule",
    plural = "mwan3rules",
    namespaced,
    status = "SdewanStatus"
)]
pub struct Mwan3RuleSpec {
    /// Name of the mwan3 policy matching traffic is sent to.
    pub policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Accessors the reconciler needs on every desired-state kind.
///
/// Metadata (labels, finalizers, deletion marker, resourceVersion) comes from
/// [`kube::Resource`]; the status block is kind specific.
pub trait SdewanResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn status(&self) -> Option<&SdewanStatus>;

    fn status_mut(&mut self) -> &mut SdewanStatus;

    /// Value of the `sdewanPurpose` label, if set and non-empty.
    fn purpose(&self) -> Option<&str> {
        self.labels()
            .get(PURPOSE_LABEL)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

impl SdewanResource for Mwan3Policy {
    fn status(&self) -> Option<&SdewanStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut SdewanStatus {
        self.status.get_or_insert_with(SdewanStatus::default)
    }
}

impl SdewanResource for Mwan3Rule {
    fn status(&self) -> Option<&SdewanStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut SdewanStatus {
        self.status.get_or_insert_with(SdewanStatus::default)
    }
}

/// Namespace + name of a desired resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".to_string()),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_purpose_label() {
        let mut policy = Mwan3Policy::new("balanced", Mwan3PolicySpec { members: vec![] });
        assert_eq!(policy.purpose(), None);

        policy
            .labels_mut()
            .insert(PURPOSE_LABEL.to_string(), String::new());
        assert_eq!(policy.purpose(), None);

        policy
            .labels_mut()
            .insert(PURPOSE_LABEL.to_string(), "cnf1".to_string());
        assert_eq!(policy.purpose(), Some("cnf1"));
    }

    #[test]
    fn test_status_mut_initializes() {
        let mut rule = Mwan3Rule::new("r1", Mwan3RuleSpec::default());
        assert!(rule.status().is_none());
        rule.status_mut().in_sync = true;
        assert!(rule.status().is_some_and(|s| s.in_sync));
    }

    #[test]
    fn test_status_wire_names() {
        let status = SdewanStatus {
            applied_version: Some("42".to_string()),
            applied_time: None,
            in_sync: true,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["appliedVersion"], "42");
        assert_eq!(json["inSync"], true);
        assert!(json.get("appliedTime").is_none());
    }

    #[test]
    fn test_crd_names() {
        let crd = Mwan3Policy::crd();
        assert_eq!(crd.spec.group, "batch.sdewan.akraino.org");
        assert_eq!(crd.spec.names.plural, "mwan3policies");
        assert_eq!(Mwan3Rule::crd().spec.names.kind, "Mwan3Rule");
    }

    #[test]
    fn test_resource_id_display() {
        let id = ResourceId::new("sdewan-system", "policy-a");
        assert_eq!(id.to_string(), "sdewan-system/policy-a");
    }
}
