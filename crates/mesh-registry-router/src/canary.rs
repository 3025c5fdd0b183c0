//! Canary router: three-way filter on the `canary` metadata tag.
//!
//! A request tagged `v` prefers instances tagged `v`, falls back to
//! untagged instances, then to any canary instance. An untagged request
//! prefers untagged instances and falls back to canary ones.

use std::sync::Arc;

use mesh_registry_core::{Instance, InstancesSet, Result};

use crate::{RouteAction, RouteInfo, ServiceRouter};

/// Metadata key carrying the canary tag on both requests and instances.
pub const CANARY_KEY: &str = "canary";

#[derive(Default)]
pub struct CanaryRouter;

impl CanaryRouter {
    pub const NAME: &'static str = "canaryRouter";

    pub fn new() -> Self {
        Self
    }
}

impl ServiceRouter for CanaryRouter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn route(&self, info: &mut RouteInfo) -> Result<RouteAction> {
        let request_tag = info
            .source_metadata_value(CANARY_KEY)
            .map(str::to_string);
        let current = info.instances.available().clone();

        let mut same_tag: Vec<Arc<Instance>> = Vec::new();
        let mut untagged: Vec<Arc<Instance>> = Vec::new();
        let mut any_canary: Vec<Arc<Instance>> = Vec::new();
        for instance in current.instances() {
            match instance.metadata().get(CANARY_KEY) {
                Some(tag) => {
                    any_canary.push(instance.clone());
                    if request_tag.as_deref() == Some(tag.as_str()) {
                        same_tag.push(instance.clone());
                    }
                }
                None => untagged.push(instance.clone()),
            }
        }
        if any_canary.is_empty() {
            // No canary deployment exists; nothing to separate.
            return Ok(RouteAction::Continue);
        }

        let members = match &request_tag {
            Some(_) => {
                if !same_tag.is_empty() {
                    same_tag
                } else if !untagged.is_empty() {
                    untagged
                } else {
                    any_canary
                }
            }
            None => {
                if !untagged.is_empty() {
                    untagged
                } else {
                    any_canary
                }
            }
        };
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
        info.record_stat(Self::NAME, "canary tag partition", discarded);
        Ok(RouteAction::Continue)
    }
}
