//! Normalized mwan3 configuration objects as exchanged with a CNF.
//!
//! These are derived from a custom resource on every reconcile and compared
//! against what a replica reports. They are never persisted by the operator.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The configuration kinds a CNF exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    Policy,
    Rule,
}

impl ConfigKind {
    /// Collection segment in the CNF's mwan3 REST API.
    pub fn collection(&self) -> &'static str {
        match self {
            ConfigKind::Policy => "policies",
            ConfigKind::Rule => "rules",
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigKind::Policy => write!(f, "policy"),
            ConfigKind::Rule => write!(f, "rule"),
        }
    }
}

/// Policy member bound to a concrete CNF interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMember {
    pub interface: String,
    pub metric: String,
    pub weight: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    pub members: Vec<PolicyMember>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub policy: String,
    #[serde(default)]
    pub src_ip: String,
    #[serde(default)]
    pub src_port: String,
    #[serde(default)]
    pub dest_ip: String,
    #[serde(default)]
    pub dest_port: String,
    #[serde(default)]
    pub proto: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub sticky: String,
    #[serde(default)]
    pub timeout: String,
}

/// A normalized configuration object, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WanConfig {
    Policy(PolicyConfig),
    Rule(RuleConfig),
}

impl WanConfig {
    pub fn kind(&self) -> ConfigKind {
        match self {
            WanConfig::Policy(_) => ConfigKind::Policy,
            WanConfig::Rule(_) => ConfigKind::Rule,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            WanConfig::Policy(p) => &p.name,
            WanConfig::Rule(r) => &r.name,
        }
    }

    /// JSON body for the CNF API.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            WanConfig::Policy(p) => serde_json::to_value(p),
            WanConfig::Rule(r) => serde_json::to_value(r),
        }
    }

    /// Decode a CNF API response body of the given kind.
    pub fn from_json(kind: ConfigKind, body: &[u8]) -> serde_json::Result<Self> {
        Ok(match kind {
            ConfigKind::Policy => WanConfig::Policy(serde_json::from_slice(body)?),
            ConfigKind::Rule => WanConfig::Rule(serde_json::from_slice(body)?),
        })
    }
}
