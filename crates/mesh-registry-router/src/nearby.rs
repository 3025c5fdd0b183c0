//! Nearby router: keeps the closest locality tier that still has usable
//! instances, walking campus → zone → region relative to the caller's
//! location, and degrades to the full set when every tier is dead.

use std::sync::Arc;

use mesh_registry_core::{Instance, InstancesSet, Location, Result};

use crate::{RouteAction, RouteInfo, ServiceRouter};

/// Locality tier, narrowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchLevel {
    Campus,
    Zone,
    Region,
}

impl MatchLevel {
    fn matches(self, caller: &Location, instance: &Location) -> bool {
        match self {
            MatchLevel::Campus => {
                caller.region == instance.region
                    && caller.zone == instance.zone
                    && caller.campus == instance.campus
            }
            MatchLevel::Zone => caller.region == instance.region && caller.zone == instance.zone,
            MatchLevel::Region => caller.region == instance.region,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NearbyConfig {
    /// Narrowest tier attempted first.
    pub match_level: MatchLevel,
    /// Widest location tier attempted before degrading to the full set.
    pub max_match_level: MatchLevel,
}

impl Default for NearbyConfig {
    fn default() -> Self {
        Self {
            match_level: MatchLevel::Campus,
            max_match_level: MatchLevel::Region,
        }
    }
}

pub struct NearbyRouter {
    config: NearbyConfig,
}

impl NearbyRouter {
    pub const NAME: &'static str = "nearbyBasedRouter";

    pub fn new(config: NearbyConfig) -> Self {
        Self { config }
    }

    fn tiers(&self) -> impl Iterator<Item = MatchLevel> {
        let start = self.config.match_level;
        let end = self.config.max_match_level;
        [MatchLevel::Campus, MatchLevel::Zone, MatchLevel::Region]
            .into_iter()
            .filter(move |tier| *tier >= start && *tier <= end)
    }
}

impl ServiceRouter for NearbyRouter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn route(&self, info: &mut RouteInfo) -> Result<RouteAction> {
        let caller = info.caller_location.clone();
        if caller.region.is_empty() && caller.zone.is_empty() && caller.campus.is_empty() {
            return Ok(RouteAction::Continue);
        }
        let circuit = info.instances.circuit();
        let current = info.instances.available().clone();

        for tier in self.tiers() {
            let members: Vec<Arc<Instance>> = current
                .instances()
                .iter()
                .filter(|inst| tier.matches(&caller, inst.location()))
                .cloned()
                .collect();
            let usable = members
                .iter()
                .any(|inst| info.is_selectable(inst, &circuit));
            if !usable {
                continue;
            }
            if members.len() == current.len() {
                return Ok(RouteAction::Continue);
            }
            let discarded = current
                .instances()
                .iter()
                .filter(|inst| !tier.matches(&caller, inst.location()))
                .map(|inst| inst.id().to_string())
                .collect();
            info.instances.narrow(Arc::new(InstancesSet::with_subset(
                members,
                current.subset_labels().clone(),
            )));
            info.record_stat(Self::NAME, "outside locality tier", discarded);
            return Ok(RouteAction::Continue);
        }

        // Every tier inside the limit is dead: degrade to the full set.
        info.record_stat(Self::NAME, "no healthy instance in any tier", Vec::new());
        Ok(RouteAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn scenario() -> Vec<mesh_registry_core::Instance> {
        vec![
            inst_at("i1", true, "A", "A1", "A1a"),
            inst_at("i2", true, "A", "A1", "A1b"),
            inst_at("i3", true, "A", "A2", ""),
            inst_at("i4", true, "B", "", ""),
        ]
    }

    fn route_with(instances: Vec<mesh_registry_core::Instance>, unhealthy: &[&str]) -> Vec<String> {
        let instances: Vec<_> = instances
            .into_iter()
            .map(|inst| {
                if unhealthy.contains(&inst.id()) {
                    mesh_registry_core::Instance::builder(inst.id(), inst.host(), inst.port())
                        .location(inst.location().clone())
                        .healthy(false)
                        .build()
                } else {
                    inst
                }
            })
            .collect();
        let mut info = info_for(instances);
        info.caller_location = Location::new("A", "A1", "A1a");
        let router = NearbyRouter::new(NearbyConfig::default());
        router.route(&mut info).unwrap();
        crate::apply_availability_filter(&mut info);
        ids(&info)
    }

    #[test]
    fn prefers_same_campus() {
        assert_eq!(route_with(scenario(), &[]), vec!["i1"]);
    }

    #[test]
    fn falls_back_to_zone() {
        assert_eq!(route_with(scenario(), &["i1"]), vec!["i2"]);
    }

    #[test]
    fn falls_back_to_region() {
        assert_eq!(route_with(scenario(), &["i1", "i2"]), vec!["i3"]);
    }

    #[test]
    fn degrades_across_regions_when_all_local_dead() {
        assert_eq!(route_with(scenario(), &["i1", "i2", "i3"]), vec!["i4"]);
    }

    #[test]
    fn caller_without_location_passes_through() {
        let mut info = info_for(scenario());
        let router = NearbyRouter::new(NearbyConfig::default());
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["i1", "i2", "i3", "i4"]);
    }

    #[test]
    fn min_level_zone_skips_campus_filter() {
        let mut info = info_for(scenario());
        info.caller_location = Location::new("A", "A1", "A1a");
        let router = NearbyRouter::new(NearbyConfig {
            match_level: MatchLevel::Zone,
            max_match_level: MatchLevel::Region,
        });
        router.route(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["i1", "i2"]);
    }
}
