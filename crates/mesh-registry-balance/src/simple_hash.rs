//! Simple hash: `instances[hash_key % n]`, with a forward linear probe
//! past half-open instances when normal candidates exist.

use mesh_registry_core::{Criteria, Result, ServiceInstances};

use crate::{instance_not_found, try_choose_half_open, LoadBalancer, Pick};

#[derive(Default)]
pub struct SimpleHashBalancer;

impl SimpleHashBalancer {
    pub const NAME: &'static str = "simpleHash";

    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for SimpleHashBalancer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn choose(&self, instances: &ServiceInstances, criteria: &Criteria) -> Result<Pick> {
        if !criteria.ignore_half_open {
            if let Some(probe) = try_choose_half_open(instances) {
                return Ok(Pick::plain(probe));
            }
        }
        let set = instances.available();
        let members = set.instances();
        if members.is_empty() {
            return Err(instance_not_found(instances.service().key()));
        }
        let circuit = instances.circuit();
        let n = members.len() as u64;
        let key = criteria.hash_key.wrapping_add(criteria.replicate_index as u64);
        let start = (key % n) as usize;
        let half_open_count = members
            .iter()
            .filter(|inst| circuit.half_open.contains_key(inst.id()))
            .count();

        let pick = &members[start];
        if circuit.half_open.contains_key(pick.id()) && half_open_count != members.len() {
            // Collision with a probing instance: probe forward to a normal
            // one.
            for offset in 1..members.len() {
                let candidate = &members[(start + offset) % members.len()];
                if !circuit.half_open.contains_key(candidate.id()) {
                    return Ok(Pick::plain(candidate.clone()));
                }
            }
        }
        Ok(Pick::plain(pick.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    #[test]
    fn modulo_indexing() {
        let view = instances_view(vec![
            weighted("A", 8001, 100),
            weighted("B", 8002, 100),
            weighted("C", 8003, 100),
        ]);
        let lb = SimpleHashBalancer::new();
        let criteria = Criteria {
            hash_key: 4,
            ignore_half_open: true,
            ..Default::default()
        };
        let pick = lb.choose(&view, &criteria).unwrap();
        assert_eq!(pick.instance.id(), view.available().instances()[1].id());
    }

    #[test]
    fn half_open_collision_probes_forward() {
        let view = instances_view(vec![
            weighted("A", 8001, 100),
            weighted("B", 8002, 100),
            weighted("C", 8003, 100),
        ]);
        let target = view.available().instances()[1].id().to_string();
        mark_half_open(&view, &target, 0);
        let lb = SimpleHashBalancer::new();
        let criteria = Criteria {
            hash_key: 4,
            ignore_half_open: true,
            ..Default::default()
        };
        let pick = lb.choose(&view, &criteria).unwrap();
        assert_ne!(pick.instance.id(), target);
    }

    #[test]
    fn all_half_open_returns_the_slot_owner() {
        let view = instances_view(vec![weighted("A", 8001, 100)]);
        mark_half_open(&view, "A", 0);
        let lb = SimpleHashBalancer::new();
        let criteria = Criteria {
            hash_key: 9,
            ignore_half_open: true,
            ..Default::default()
        };
        assert_eq!(lb.choose(&view, &criteria).unwrap().instance.id(), "A");
    }

    #[test]
    fn empty_set_errors() {
        let view = instances_view(vec![]);
        let lb = SimpleHashBalancer::new();
        let err = lb.choose(&view, &Criteria::default()).unwrap_err();
        assert_eq!(err.code(), mesh_registry_core::ReturnCode::InstanceNotFound);
    }
}
