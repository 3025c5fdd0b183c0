//! Set-division router: when both caller and callee carry a
//! `name.area.group` set label, traffic stays inside the caller's set.
//! A `*` group segment on the callee side catches any caller group; the
//! wildcard set is the fallback when the exact group has no members.

use std::sync::Arc;

use mesh_registry_core::{Instance, InstancesSet, Result};

use crate::{RouteAction, RouteInfo, ServiceRouter};

/// Metadata key that opts an instance into set division.
pub const ENABLE_SET_KEY: &str = "internal-enable-set";
/// Metadata key carrying the `name.area.group` set label.
pub const SET_NAME_KEY: &str = "internal-set-name";

const ENABLED_VALUE: &str = "Y";

#[derive(Debug, Clone, PartialEq, Eq)]
struct SetName<'a> {
    name: &'a str,
    area: &'a str,
    group: &'a str,
}

fn parse_set(value: &str) -> Option<SetName<'_>> {
    let mut parts = value.splitn(3, '.');
    let name = parts.next()?;
    let area = parts.next()?;
    let group = parts.next().unwrap_or("");
    if name.is_empty() || area.is_empty() {
        return None;
    }
    Some(SetName { name, area, group })
}

fn instance_set(instance: &Instance) -> Option<&str> {
    if instance.metadata().get(ENABLE_SET_KEY).map(String::as_str) != Some(ENABLED_VALUE) {
        return None;
    }
    instance.metadata().get(SET_NAME_KEY).map(String::as_str)
}

#[derive(Default)]
pub struct SetDivisionRouter;

impl SetDivisionRouter {
    pub const NAME: &'static str = "setDivisionRouter";

    pub fn new() -> Self {
        Self
    }
}

impl ServiceRouter for SetDivisionRouter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn route(&self, info: &mut RouteInfo) -> Result<RouteAction> {
        let Some(caller_value) = info.source_metadata_value(SET_NAME_KEY) else {
            return Ok(RouteAction::Continue);
        };
        let Some(caller) = parse_set(caller_value) else {
            return Ok(RouteAction::Continue);
        };

        let current = info.instances.available().clone();
        let mut exact: Vec<Arc<Instance>> = Vec::new();
        let mut wildcard: Vec<Arc<Instance>> = Vec::new();
        let mut any_set_enabled = false;
        for instance in current.instances() {
            let Some(set_value) = instance_set(instance) else {
                continue;
            };
            any_set_enabled = true;
            let Some(callee) = parse_set(set_value) else {
                continue;
            };
            if callee.name != caller.name || callee.area != caller.area {
                continue;
            }
            if callee.group == caller.group {
                exact.push(instance.clone());
            } else if callee.group == "*" {
                wildcard.push(instance.clone());
            }
        }

        // Callee does not participate in set division at all.
        if !any_set_enabled {
            return Ok(RouteAction::Continue);
        }

        let members = if !exact.is_empty() { exact } else { wildcard };
        if members.is_empty() {
            // The caller's set has no members on the callee side; keep the
            // chain alive with the unfiltered set rather than black-holing.
            info.record_stat(Self::NAME, "caller set has no members", Vec::new());
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
        info.record_stat(Self::NAME, "outside caller set", discarded);
        Ok(RouteAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use mesh_registry_core::ServiceInfo;
    use std::collections::HashMap;

    fn set_inst(id: &str, set: &str) -> mesh_registry_core::Instance {
        inst_meta(id, true, &[(ENABLE_SET_KEY, "Y"), (SET_NAME_KEY, set)])
    }

    fn with_caller_set(instances: Vec<mesh_registry_core::Instance>, set: &str) -> RouteInfo {
        let mut info = info_for(instances);
        info.source = Some(ServiceInfo {
            service_key: None,
            metadata: HashMap::from([(SET_NAME_KEY.to_string(), set.to_string())]),
        });
        info
    }

    #[test]
    fn exact_group_match_wins() {
        let router = SetDivisionRouter::new();
        let mut info = with_caller_set(
            vec![set_inst("i1", "app.sz.1"), set_inst("i2", "app.sz.*")],
            "app.sz.1",
        );
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["i1"]);
    }

    #[test]
    fn wildcard_group_catches_unmatched_caller_group() {
        let router = SetDivisionRouter::new();
        let mut info = with_caller_set(
            vec![set_inst("i1", "app.sz.1"), set_inst("i2", "app.sz.*")],
            "app.sz.3",
        );
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["i2"]);
    }

    #[test]
    fn different_area_is_excluded() {
        let router = SetDivisionRouter::new();
        let mut info = with_caller_set(
            vec![set_inst("i1", "app.gz.1"), set_inst("i2", "app.sz.1")],
            "app.sz.1",
        );
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["i2"]);
    }

    #[test]
    fn caller_without_set_passes_through() {
        let router = SetDivisionRouter::new();
        let mut info = info_for(vec![set_inst("i1", "app.sz.1"), inst("i2", true)]);
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["i1", "i2"]);
    }

    #[test]
    fn callee_without_sets_passes_through() {
        let router = SetDivisionRouter::new();
        let mut info = with_caller_set(vec![inst("i1", true), inst("i2", true)], "app.sz.1");
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["i1", "i2"]);
    }

    #[test]
    fn no_member_in_caller_set_keeps_full_set() {
        let router = SetDivisionRouter::new();
        let mut info = with_caller_set(vec![set_inst("i1", "other.sz.1")], "app.sz.1");
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["i1"]);
    }
}
