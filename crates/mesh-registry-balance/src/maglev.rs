//! Maglev lookup-table balancer.
//!
//! Each instance derives `(offset, skip)` from two hashes of its id and
//! claims seats in a prime-sized table via the canonical permutation;
//! `choose` indexes the table by `hash_key % table_size`.

use std::any::Any;
use std::sync::Arc;

use mesh_registry_core::{
    Criteria, Instance, RegistryError, Result, ReturnCode, Selector, ServiceInstances,
};

use crate::hash::{criteria_key, HashFn};
use crate::{instance_not_found, LoadBalancer, Pick};

fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    let mut i = 2u64;
    let n = u64::from(n);
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

struct MaglevSelector {
    table: Vec<usize>,
    instances: Vec<Arc<Instance>>,
}

impl Selector for MaglevSelector {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl MaglevSelector {
    fn build(view: &ServiceInstances, table_size: u32, hash: HashFn) -> Self {
        let mut instances: Vec<Arc<Instance>> = view.available().instances().to_vec();
        instances.sort_by(|a, b| a.id().cmp(b.id()));
        let m = table_size as usize;
        let mut table = vec![usize::MAX; m];
        if instances.is_empty() {
            return Self { table, instances };
        }

        // Canonical permutation: offset from one hash, skip from another.
        let mut offsets = Vec::with_capacity(instances.len());
        let mut skips = Vec::with_capacity(instances.len());
        for instance in &instances {
            let h1 = hash(instance.id().as_bytes());
            let h2 = hash(format!("{}#seat", instance.id()).as_bytes());
            offsets.push((h1 % m as u64) as usize);
            skips.push((h2 % (m as u64 - 1) + 1) as usize);
        }

        let mut next = vec![0usize; instances.len()];
        let mut filled = 0usize;
        'fill: loop {
            for index in 0..instances.len() {
                let mut seat = (offsets[index] + next[index] * skips[index]) % m;
                while table[seat] != usize::MAX {
                    next[index] += 1;
                    seat = (offsets[index] + next[index] * skips[index]) % m;
                }
                table[seat] = index;
                next[index] += 1;
                filled += 1;
                if filled == m {
                    break 'fill;
                }
            }
        }
        Self { table, instances }
    }
}

#[derive(Debug)]
pub struct MaglevBalancer {
    table_size: u32,
    hash: HashFn,
}

impl MaglevBalancer {
    pub const NAME: &'static str = "maglev";

    pub fn new(table_size: u32, hash: HashFn) -> Result<Self> {
        if !is_prime(table_size) {
            return Err(RegistryError::with_detail(
                ReturnCode::InvalidConfig,
                format!("maglev table size {table_size} must be prime"),
            ));
        }
        Ok(Self { table_size, hash })
    }
}

impl LoadBalancer for MaglevBalancer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn choose(&self, instances: &ServiceInstances, criteria: &Criteria) -> Result<Pick> {
        let selector = instances.available().selector_or_build(|| {
            Box::new(MaglevSelector::build(instances, self.table_size, self.hash))
        });
        let Some(selector) = selector.as_any().downcast_ref::<MaglevSelector>() else {
            return Err(instance_not_found(instances.service().key()));
        };
        if selector.instances.is_empty() {
            return Err(instance_not_found(instances.service().key()));
        }
        let key = criteria_key(criteria, self.hash);
        let m = selector.table.len() as u64;
        let circuit = instances.circuit();
        // replicate_index and half-open exhaustion both advance the slot;
        // indexes past the set size wrap back onto it.
        let want_skip = criteria.replicate_index % selector.instances.len();
        let mut seen = Vec::new();
        let mut skipped = 0usize;
        for step in 0..selector.table.len() {
            let slot = ((key.wrapping_add(step as u64)) % m) as usize;
            let index = selector.table[slot];
            if index == usize::MAX || seen.contains(&index) {
                continue;
            }
            seen.push(index);
            if skipped < want_skip {
                skipped += 1;
                continue;
            }
            let Some(instance) = selector.instances.get(index) else {
                continue;
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
