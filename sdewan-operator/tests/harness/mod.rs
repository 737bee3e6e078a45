//! Test harness for reconcile integration tests
//!
//! Wires a reconcile context to the in-memory store, resolver and CNF client.

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;

use sdewan_operator::crd::{
    Mwan3PolicyMember, Mwan3PolicySpec, Mwan3RuleSpec, FINALIZER, PURPOSE_LABEL,
};
use sdewan_operator::model::{PolicyConfig, PolicyMember, WanConfig};
use sdewan_operator::resolver::TargetGroup;
use sdewan_operator::test_util::{cnf_group, FakeResolver, FakeStore, RecordingRemote};
use sdewan_operator::{Context, Mwan3Policy, Mwan3Rule, PolicyHandler, RuleHandler, TypeHandler};

pub const NAMESPACE: &str = "sdewan-system";
pub const PURPOSE: &str = "cnf1";

pub const CNF_A: &str = "10.10.0.1";
pub const CNF_B: &str = "10.10.0.2";
pub const CNF_C: &str = "10.10.0.3";

pub fn ip(addr: &str) -> IpAddr {
    addr.parse().expect("valid test address")
}

pub struct Harness<H: TypeHandler> {
    pub ctx: Context<H>,
    pub store: Arc<FakeStore<H::Resource>>,
    pub resolver: Arc<FakeResolver>,
    pub remote: Arc<RecordingRemote>,
}

pub fn group(addresses: &[&str]) -> TargetGroup {
    cnf_group(&[("wan1", "net0"), ("wan2", "net1")], addresses)
}

/// Policy reconcile context with the `cnf1` purpose served by `addresses`.
pub fn policy_harness(addresses: &[&str]) -> Harness<PolicyHandler> {
    let _ = tracing_subscriber::fmt::try_init();

    let store: Arc<FakeStore<Mwan3Policy>> = Arc::new(FakeStore::new());
    let resolver = Arc::new(FakeResolver::new().with_group(PURPOSE, group(addresses)));
    let remote = Arc::new(RecordingRemote::new());
    let ctx = Context::new(
        PolicyHandler::new(remote.clone()),
        store.clone(),
        resolver.clone(),
    );
    Harness {
        ctx,
        store,
        resolver,
        remote,
    }
}

/// Rule reconcile context with the `cnf1` purpose served by `addresses`.
pub fn rule_harness(addresses: &[&str]) -> Harness<RuleHandler> {
    let _ = tracing_subscriber::fmt::try_init();

    let store: Arc<FakeStore<Mwan3Rule>> = Arc::new(FakeStore::new());
    let resolver = Arc::new(FakeResolver::new().with_group(PURPOSE, group(addresses)));
    let remote = Arc::new(RecordingRemote::new());
    let ctx = Context::new(
        RuleHandler::new(remote.clone()),
        store.clone(),
        resolver.clone(),
    );
    Harness {
        ctx,
        store,
        resolver,
        remote,
    }
}

/// `balanced` policy: wan1 metric 1 weight 10, wan2 metric 2 weight 20.
pub fn balanced_policy() -> Mwan3Policy {
    let mut policy = Mwan3Policy::new(
        "balanced",
        Mwan3PolicySpec {
            members: vec![
                Mwan3PolicyMember {
                    network: "wan1".to_string(),
                    metric: 1,
                    weight: 10,
                },
                Mwan3PolicyMember {
                    network: "wan2".to_string(),
                    metric: 2,
                    weight: 20,
                },
            ],
        },
    );
    policy.metadata.namespace = Some(NAMESPACE.to_string());
    policy.metadata.labels = Some([(PURPOSE_LABEL.to_string(), PURPOSE.to_string())].into());
    policy
}

/// What `balanced_policy()` converts to against the harness group.
pub fn balanced_config() -> WanConfig {
    WanConfig::Policy(PolicyConfig {
        name: "balanced".to_string(),
        members: vec![
            PolicyMember {
                interface: "net0".to_string(),
                metric: "1".to_string(),
                weight: "10".to_string(),
            },
            PolicyMember {
                interface: "net1".to_string(),
                metric: "2".to_string(),
                weight: "20".to_string(),
            },
        ],
    })
}

/// Same name as `balanced_config()` but with a different weight.
pub fn stale_config() -> WanConfig {
    WanConfig::Policy(PolicyConfig {
        name: "balanced".to_string(),
        members: vec![PolicyMember {
            interface: "net0".to_string(),
            metric: "1".to_string(),
            weight: "1".to_string(),
        }],
    })
}

/// `https-out` rule sending TCP/443 into the `balanced` policy.
pub fn https_rule() -> Mwan3Rule {
    let mut rule = Mwan3Rule::new(
        "https-out",
        Mwan3RuleSpec {
            policy: "balanced".to_string(),
            dest_port: Some("443".to_string()),
            proto: Some("tcp".to_string()),
            family: Some("ipv4".to_string()),
            ..Default::default()
        },
    );
    rule.metadata.namespace = Some(NAMESPACE.to_string());
    rule.metadata.labels = Some([(PURPOSE_LABEL.to_string(), PURPOSE.to_string())].into());
    rule
}

pub fn with_finalizer<K: kube::Resource>(mut obj: K) -> K {
    obj.meta_mut().finalizers = Some(vec![FINALIZER.to_string()]);
    obj
}
