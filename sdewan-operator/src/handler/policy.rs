//! Mwan3Policy handler - maps policy members onto CNF interfaces.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

use super::{ConversionError, TypeHandler};
use crate::clients::RemoteClient;
use crate::crd::Mwan3Policy;
use crate::model::{ConfigKind, PolicyConfig, PolicyMember, WanConfig};
use crate::resolver::TargetGroup;
use crate::util::net_to_iface;

pub struct PolicyHandler {
    remote: Arc<dyn RemoteClient>,
}

impl PolicyHandler {
    pub fn new(remote: Arc<dyn RemoteClient>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl TypeHandler for PolicyHandler {
    type Resource = Mwan3Policy;

    fn kind(&self) -> &'static str {
        "Mwan3Policy"
    }

    fn config_kind(&self) -> ConfigKind {
        ConfigKind::Policy
    }

    fn remote(&self) -> &dyn RemoteClient {
        self.remote.as_ref()
    }

    fn convert(
        &self,
        resource: &Mwan3Policy,
        group: &TargetGroup,
    ) -> Result<WanConfig, ConversionError> {
        if resource.spec.members.is_empty() {
            return Err(ConversionError::MissingField("members"));
        }

        let members = resource
            .spec
            .members
            .iter()
            .map(|member| -> Result<PolicyMember, ConversionError> {
                Ok(PolicyMember {
                    interface: net_to_iface(&member.network, &group.deployment, &group.annotations)?,
                    metric: member.metric.to_string(),
                    weight: member.weight.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(WanConfig::Policy(PolicyConfig {
            name: resource.name_any(),
            members,
        }))
    }
}
