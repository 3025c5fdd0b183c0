//! Metadata router: keeps instances whose metadata matches every pair in
//! the request, with configurable failover when nothing matches.

use std::sync::Arc;

use mesh_registry_core::{
    Instance, InstancesSet, MetadataFailover, RegistryError, Result, ReturnCode,
};

use crate::{RouteAction, RouteInfo, ServiceRouter};

#[derive(Default)]
pub struct MetadataRouter;

impl MetadataRouter {
    pub const NAME: &'static str = "dstMetaRouter";

    pub fn new() -> Self {
        Self
    }
}

impl ServiceRouter for MetadataRouter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn route(&self, info: &mut RouteInfo) -> Result<RouteAction> {
        let Some(param) = info.metadata_param.clone() else {
            return Ok(RouteAction::Continue);
        };
        if param.metadata.is_empty() {
            return Ok(RouteAction::Continue);
        }
        let current = info.instances.available().clone();

        let matches = |instance: &Instance| {
            param
                .metadata
                .iter()
                .all(|(k, v)| instance.metadata().get(k) == Some(v))
        };
        let mut members: Vec<Arc<Instance>> = current
            .instances()
            .iter()
            .filter(|inst| matches(inst))
            .cloned()
            .collect();

        let mut reason = "metadata mismatch";
        if members.is_empty() {
            match param.failover {
                MetadataFailover::None => {
                    return Err(RegistryError::with_detail(
                        ReturnCode::RouteRuleNotMatch,
                        format!("no instance matches request metadata for {}", info.dest_key),
                    ));
                }
                MetadataFailover::NotKey => {
                    reason = "metadata failover: instances without the keys";
                    members = current
                        .instances()
                        .iter()
                        .filter(|inst| {
                            param
                                .metadata
                                .keys()
                                .all(|k| !inst.metadata().contains_key(k))
                        })
                        .cloned()
                        .collect();
                    if members.is_empty() {
                        return Err(RegistryError::with_detail(
                            ReturnCode::RouteRuleNotMatch,
                            format!(
                                "metadata failover found no key-free instance for {}",
                                info.dest_key
                            ),
                        ));
                    }
                }
                MetadataFailover::All => {
                    reason = "metadata failover: all instances";
                    members = current.instances().to_vec();
                }
            }
        }

        if members.len() == current.len() {
            return Ok(RouteAction::Continue);
        }
        let discarded = current
            .instances()
            .iter()
            .filter(|inst| !members.iter().any(|kept| kept.id() == inst.id()))
            .map(|inst| inst.id().to_string())
            .collect();
        info.instances.narrow(Arc::new(InstancesSet::with_subset(
            members,
            current.subset_labels().clone(),
        )));
        info.record_stat(Self::NAME, reason, discarded);
        Ok(RouteAction::Continue)
    }
}
