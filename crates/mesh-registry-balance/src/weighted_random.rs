//! Weighted random: prefix-sum over static or dynamic weights, binary
//! search on a uniform roll. Half-open instances are offered probe traffic
//! first; when no normal instance carries weight, the half-open set becomes
//! the pool.

use std::any::Any;
use std::sync::Arc;

use rand::Rng;

use mesh_registry_core::{Criteria, Instance, Result, Selector, ServiceInstances};

use crate::{instance_not_found, try_choose_half_open, LoadBalancer, Pick};

struct WeightEntry {
    bound: u64,
    instance: Arc<Instance>,
}

struct RandomSelector {
    cb_version: u64,
    sum: u64,
    entries: Vec<WeightEntry>,
    /// True when the pool fell back to half-open instances.
    half_open_pool: bool,
}

impl Selector for RandomSelector {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RandomSelector {
    fn build(instances: &ServiceInstances, dynamic: bool) -> Self {
        let circuit = instances.circuit();
        let weight_of = |inst: &Instance| -> u64 {
            if dynamic {
                u64::from(inst.dynamic_weight())
            } else {
                u64::from(inst.weight())
            }
        };
        let mut sum = 0u64;
        let mut entries = Vec::new();
        for instance in instances.available().instances() {
            if circuit.half_open.contains_key(instance.id()) {
                continue;
            }
            let weight = weight_of(instance);
            if weight == 0 {
                continue;
            }
            sum += weight;
            entries.push(WeightEntry {
                bound: sum,
                instance: instance.clone(),
            });
        }
        let mut half_open_pool = false;
        if sum == 0 {
            // Every weighted instance is half-open: probe traffic is all
            // the traffic there is.
            for instance in instances.available().instances() {
                if !circuit.half_open.contains_key(instance.id()) {
                    continue;
                }
                let weight = weight_of(instance);
                if weight == 0 {
                    continue;
                }
                sum += weight;
                entries.push(WeightEntry {
                    bound: sum,
                    instance: instance.clone(),
                });
            }
            half_open_pool = true;
        }
        Self {
            cb_version: circuit.version,
            sum,
            entries,
            half_open_pool,
        }
    }

    fn pick(&self, roll: u64) -> Option<&Arc<Instance>> {
        let index = self
            .entries
            .partition_point(|entry| entry.bound <= roll);
        self.entries.get(index).map(|entry| &entry.instance)
    }
}

pub struct WeightedRandomBalancer {
    enable_dynamic_weight: bool,
}

impl WeightedRandomBalancer {
    pub const NAME: &'static str = "weightedRandom";

    pub fn new(enable_dynamic_weight: bool) -> Self {
        Self {
            enable_dynamic_weight,
        }
    }

    fn selector(&self, instances: &ServiceInstances) -> Arc<Box<dyn Selector>> {
        let set = instances.available();
        let current_version = instances.service().cb_version();
        let cached = set.selector_or_build(|| {
            Box::new(RandomSelector::build(instances, self.enable_dynamic_weight))
        });
        let stale = cached
            .as_any()
            .downcast_ref::<RandomSelector>()
            .map_or(true, |selector| selector.cb_version != current_version);
        if !stale {
            return cached;
        }
        set.clear_selector();
        set.selector_or_build(|| {
            Box::new(RandomSelector::build(instances, self.enable_dynamic_weight))
        })
    }
}

impl LoadBalancer for WeightedRandomBalancer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn choose(&self, instances: &ServiceInstances, criteria: &Criteria) -> Result<Pick> {
        if !criteria.ignore_half_open {
            if let Some(probe) = try_choose_half_open(instances) {
                return Ok(Pick::plain(probe));
            }
        }
        let selector = self.selector(instances);
        let Some(selector) = selector.as_any().downcast_ref::<RandomSelector>() else {
            return Err(instance_not_found(instances.service().key()));
        };
        if selector.sum == 0 {
            return Err(instance_not_found(instances.service().key()));
        }
        if selector.half_open_pool && criteria.ignore_half_open {
            return Err(instance_not_found(instances.service().key()));
        }
        let roll = rand::rng().random_range(0..selector.sum);
        match selector.pick(roll) {
            Some(instance) => Ok(Pick::plain(instance.clone())),
            None => Err(instance_not_found(instances.service().key())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use std::collections::HashMap;

    #[test]
    fn empty_set_is_instance_not_found(){
        let view = instances_view(vec![]);
        let lb = WeightedRandomBalancer::new(false);
        let err = lb.choose(&view, &Criteria::default()).unwrap_err();
        assert_eq!(err.code(), mesh_registry_core::ReturnCode::InstanceNotFound);
    }

    #[test]
    fn weights_shape_the_distribution() {
        let view = instances_view(vec![
            weighted("heavy", 8001, 900),
            weighted("light", 8002, 100),
        ]);
        let lb = WeightedRandomBalancer::new(false);
        let mut heavy = 0;
        for _ in 0..2000 {
            let pick = lb.choose(&view, &Criteria::default()).unwrap();
            if pick.instance.id() == "heavy" {
                heavy += 1;
            }
        }
        // 90% expectation with generous slack.
        assert!(heavy > 1500, "heavy picked {heavy} of 2000");
    }

    #[test]
    fn half_open_gets_probe_traffic_first() {
        let view = instances_view(vec![
            weighted("normal", 8001, 100),
            weighted("probing", 8002, 100),
        ]);
        mark_half_open(&view, "probing", 2);
        let lb = WeightedRandomBalancer::new(false);
        let first = lb.choose(&view, &Criteria::default()).unwrap();
        assert_eq!(first.instance.id(), "probing");
        let second = lb.choose(&view, &Criteria::default()).unwrap();
        assert_eq!(second.instance.id(), "probing");
        // Budget exhausted: traffic returns to the normal pool.
        for _ in 0..20 {
            let pick = lb.choose(&view, &Criteria::default()).unwrap();
            assert_eq!(pick.instance.id(), "normal");
        }
    }

    #[test]
    fn ignore_half_open_skips_probing() {
        let view = instances_view(vec![
            weighted("normal", 8001, 100),
            weighted("probing", 8002, 100),
        ]);
        mark_half_open(&view, "probing", 3);
        let lb = WeightedRandomBalancer::new(false);
        let criteria = Criteria {
            ignore_half_open: true,
            ..Default::default()
        };
        for _ in 0..20 {
            let pick = lb.choose(&view, &criteria).unwrap();
            assert_eq!(pick.instance.id(), "normal");
        }
        assert_eq!(view.service().half_open_budget("probing"), Some(3));
    }

    #[test]
    fn all_half_open_without_budget_becomes_the_pool() {
        let view = instances_view(vec![weighted("only", 8001, 100)]);
        let mut half_open = HashMap::new();
        half_open.insert("only".to_string(), 0u32);
        view.service().publish_circuit(
            Default::default(),
            half_open,
            Default::default(),
        );
        let lb = WeightedRandomBalancer::new(false);
        // No token to claim, but the half-open pool still serves.
        let pick = lb.choose(&view, &Criteria::default()).unwrap();
        assert_eq!(pick.instance.id(), "only");
    }

    #[test]
    fn dynamic_weights_are_honored() {
        let view = instances_view(vec![
            weighted("a", 8001, 500),
            weighted("b", 8002, 500),
        ]);
        // Adjuster zeroes instance a.
        view.available().instances()[0].set_dynamic_weight(0);
        let lb = WeightedRandomBalancer::new(true);
        for _ in 0..20 {
            let pick = lb.choose(&view, &Criteria::default()).unwrap();
            assert_eq!(pick.instance.id(), "b");
        }
    }
}
