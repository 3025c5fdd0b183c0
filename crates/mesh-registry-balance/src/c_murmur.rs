//! Legacy-compatible consistent hash.
//!
//! Same ring concept as ketama but with the murmur3 x86-32 hash and the
//! `host:port-replica` point layout that pre-existing clients use, so both
//! sides agree on instance selection for a given key.

use std::any::Any;
use std::sync::Arc;

use mesh_registry_core::{Criteria, Instance, Result, Selector, ServiceInstances};

use crate::hash::murmur3_32;
use crate::{instance_not_found, LoadBalancer, Pick};

struct CompatSelector {
    ring: Vec<(u32, usize)>,
    instances: Vec<Arc<Instance>>,
}

impl Selector for CompatSelector {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl CompatSelector {
    fn build(view: &ServiceInstances, replicas: u32) -> Self {
        let mut instances: Vec<Arc<Instance>> = view.available().instances().to_vec();
        instances.sort_by(|a, b| (a.host(), a.port()).cmp(&(b.host(), b.port())));
        let mut ring = Vec::with_capacity(instances.len() * replicas as usize);
        for (index, instance) in instances.iter().enumerate() {
            for replica in 0..replicas {
                let point = murmur3_32(
                    format!("{}:{}-{replica}", instance.host(), instance.port()).as_bytes(),
                );
                ring.push((point, index));
            }
        }
        ring.sort_unstable();
        Self { ring, instances }
    }

    fn nth_distinct(&self, key: u32, n: usize) -> Option<&Arc<Instance>> {
        if self.ring.is_empty() {
            return None;
        }
        let start = self.ring.partition_point(|(point, _)| *point < key) % self.ring.len();
        let mut seen = Vec::new();
        for offset in 0..self.ring.len() {
            let (_, index) = self.ring[(start + offset) % self.ring.len()];
            if !seen.contains(&index) {
                seen.push(index);
                if seen.len() > n {
                    return self.instances.get(index);
                }
            }
        }
        None
    }
}

pub struct CMurmurBalancer {
    replicas: u32,
}

impl CMurmurBalancer {
    pub const NAME: &'static str = "cMurmurHash";

    pub fn new(replicas: u32) -> Self {
        Self {
            replicas: replicas.max(1),
        }
    }
}

impl LoadBalancer for CMurmurBalancer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn choose(&self, instances: &ServiceInstances, criteria: &Criteria) -> Result<Pick> {
        let selector = instances
            .available()
            .selector_or_build(|| Box::new(CompatSelector::build(instances, self.replicas)));
        let Some(selector) = selector.as_any().downcast_ref::<CompatSelector>() else {
            return Err(instance_not_found(instances.service().key()));
        };
        // Legacy clients fold the key to 32 bits.
        let key = match &criteria.hash_string {
            Some(text) if !text.is_empty() => murmur3_32(text.as_bytes()),
            _ => criteria.hash_key as u32,
        };
        let circuit = instances.circuit();
        let candidates = selector.instances.len();
        for extra in 0..candidates.max(1) {
            let target = criteria
                .replicate_index
                .checked_add(extra)
                .map_or(extra, |n| n % candidates.max(1));
            let Some(instance) = selector.nth_distinct(key, target) else {
                break;
            };
            let is_half_open = circuit.half_open.contains_key(instance.id());
            if is_half_open && !criteria.ignore_half_open {
                if instances.service().try_claim_half_open(instance.id()) {
                    return Ok(Pick::plain(instance.clone()));
                }
                continue;
            }
            return Ok(Pick::plain(instance.clone()));
        }
        Err(instance_not_found(instances.service().key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    #[test]
    fn same_key_same_instance() {
        let view = instances_view(vec![
            weighted("A", 8001, 100),
            weighted("B", 8002, 100),
            weighted("C", 8003, 100),
        ]);
        let lb = CMurmurBalancer::new(100);
        let criteria = Criteria {
            hash_key: 777,
            ..Default::default()
        };
        let first = lb.choose(&view, &criteria).unwrap().instance.id().to_string();
        for _ in 0..5 {
            assert_eq!(lb.choose(&view, &criteria).unwrap().instance.id(), first);
        }
    }

    #[test]
    fn ring_agrees_across_balancer_instances() {
        // Two independently built balancers agree, as two processes would.
        let view_a = instances_view(vec![weighted("A", 8001, 100), weighted("B", 8002, 100)]);
        let view_b = instances_view(vec![weighted("A", 8001, 100), weighted("B", 8002, 100)]);
        let lb_a = CMurmurBalancer::new(100);
        let lb_b = CMurmurBalancer::new(100);
        for key in 0..50u64 {
            let criteria = Criteria {
                hash_key: key,
                ..Default::default()
            };
            assert_eq!(
                lb_a.choose(&view_a, &criteria).unwrap().instance.id(),
                lb_b.choose(&view_b, &criteria).unwrap().instance.id()
            );
        }
    }

    #[test]
    fn string_keys_fold_to_32_bits() {
        let view = instances_view(vec![weighted("A", 8001, 100), weighted("B", 8002, 100)]);
        let lb = CMurmurBalancer::new(100);
        let criteria = Criteria {
            hash_string: Some("user-42".to_string()),
            ..Default::default()
        };
        let first = lb.choose(&view, &criteria).unwrap().instance.id().to_string();
        assert_eq!(lb.choose(&view, &criteria).unwrap().instance.id(), first);
    }
}
