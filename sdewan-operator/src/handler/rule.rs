//! Mwan3Rule handler - validates match criteria and maps them to an mwan3 rule.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

use super::{ConversionError, TypeHandler};
use crate::clients::RemoteClient;
use crate::crd::Mwan3Rule;
use crate::model::{ConfigKind, RuleConfig, WanConfig};
use crate::resolver::TargetGroup;

const FAMILIES: &[&str] = &["ipv4", "ipv6", "any"];
const PROTOCOLS: &[&str] = &["tcp", "udp", "icmp", "all"];
const STICKY: &[&str] = &["0", "1"];

pub struct RuleHandler {
    remote: Arc<dyn RemoteClient>,
}

impl RuleHandler {
    pub fn new(remote: Arc<dyn RemoteClient>) -> Self {
        Self { remote }
    }
}

/// Check an optional field against a fixed set of values.
fn one_of(
    field: &'static str,
    value: &Option<String>,
    allowed: &[&str],
) -> Result<String, ConversionError> {
    match value.as_deref() {
        None | Some("") => Ok(String::new()),
        Some(v) if allowed.contains(&v) => Ok(v.to_string()),
        Some(v) => Err(ConversionError::InvalidField {
            field,
            value: v.to_string(),
        }),
    }
}

/// A port or `lo-hi` port range.
fn port_range(field: &'static str, value: &Option<String>) -> Result<String, ConversionError> {
    let Some(v) = value.as_deref().filter(|v| !v.is_empty()) else {
        return Ok(String::new());
    };
    let invalid = || ConversionError::InvalidField {
        field,
        value: v.to_string(),
    };
    let port = |p: &str| p.parse::<u16>().ok().filter(|p| *p != 0);

    match v.split_once('-') {
        None => port(v).map(|_| v.to_string()).ok_or_else(invalid),
        Some((lo, hi)) => match (port(lo), port(hi)) {
            (Some(lo), Some(hi)) if lo <= hi => Ok(v.to_string()),
            _ => Err(invalid()),
        },
    }
}

fn timeout(value: &Option<String>) -> Result<String, ConversionError> {
    match value.as_deref() {
        None | Some("") => Ok(String::new()),
        Some(v) if v.parse::<u32>().is_ok() => Ok(v.to_string()),
        Some(v) => Err(ConversionError::InvalidField {
            field: "timeout",
            value: v.to_string(),
        }),
    }
}

#[async_trait]
impl TypeHandler for RuleHandler {
    type Resource = Mwan3Rule;

    fn kind(&self) -> &'static str {
        "Mwan3Rule"
    }

    fn config_kind(&self) -> ConfigKind {
        ConfigKind::Rule
    }

    fn remote(&self) -> &dyn RemoteClient {
        self.remote.as_ref()
    }

    fn convert(
        &self,
        resource: &Mwan3Rule,
        _group: &TargetGroup,
    ) -> Result<WanConfig, ConversionError> {
        let spec = &resource.spec;
        if spec.policy.is_empty() {
            return Err(ConversionError::MissingField("policy"));
        }

        Ok(WanConfig::Rule(RuleConfig {
            name: resource.name_any(),
            policy: spec.policy.clone(),
            src_ip: spec.src_ip.clone().unwrap_or_default(),
            src_port: port_range("src_port", &spec.src_port)?,
            dest_ip: spec.dest_ip.clone().unwrap_or_default(),
            dest_port: port_range("dest_port", &spec.dest_port)?,
            proto: one_of("proto", &spec.proto, PROTOCOLS)?,
            family: one_of("family", &spec.family, FAMILIES)?,
            sticky: one_of("sticky", &spec.sticky, STICKY)?,
            timeout: timeout(&spec.timeout)?,
        }))
    }
}
