//! Ketama ring hash.
//!
//! Each instance claims `vnode_count × weight_fraction` points on a 64-bit
//! ring; a request walks clockwise from its key, with `replicate_index`
//! advancing to the next distinct instance for retry picks. Newly added
//! instances ramp their virtual-node share over ~60 s (10/16/33/50/66/83/
//! 100 %) so cold caches are not flooded.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use mesh_registry_core::{clock, Criteria, Instance, Result, Selector, ServiceInstances};

use crate::hash::{criteria_key, HashFn};
use crate::{instance_not_found, LoadBalancer, Pick};

/// Percent of the full vnode share at each 10 s ramp step.
const SLOW_START_PCT: [u32; 7] = [10, 16, 33, 50, 66, 83, 100];
const SLOW_START_STEP_MS: u64 = 10_000;

fn ramp_pct(elapsed_ms: u64) -> u32 {
    let step = (elapsed_ms / SLOW_START_STEP_MS) as usize;
    SLOW_START_PCT[step.min(SLOW_START_PCT.len() - 1)]
}

struct RingSelector {
    /// (vnode hash, index into `instances`) sorted by hash.
    ring: Vec<(u64, usize)>,
    instances: Vec<Arc<Instance>>,
    stage_signature: u64,
}

impl Selector for RingSelector {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RingSelector {
    fn build(
        view: &ServiceInstances,
        vnode_count: u32,
        hash: HashFn,
        stages: &HashMap<String, u32>,
        signature: u64,
    ) -> Self {
        // Stable ordering by id keeps rings identical across processes.
        let mut instances: Vec<Arc<Instance>> = view.available().instances().to_vec();
        instances.sort_by(|a, b| a.id().cmp(b.id()));

        let total_weight: u64 = instances.iter().map(|inst| u64::from(inst.weight())).sum();
        let mut ring = Vec::new();
        if total_weight > 0 {
            for (index, instance) in instances.iter().enumerate() {
                let fraction = instance.weight() as f64 / total_weight as f64;
                let pct = stages.get(instance.id()).copied().unwrap_or(100);
                let count = ((vnode_count as f64 * fraction) * (pct as f64 / 100.0)).round()
                    as usize;
                for vnode in 0..count.max(1) {
                    let point = hash(format!("{}#{vnode}", instance.id()).as_bytes());
                    ring.push((point, index));
                }
            }
        }
        ring.sort_unstable();
        Self {
            ring,
            instances,
            stage_signature: signature,
        }
    }

    /// The `n`-th distinct instance clockwise from `key`.
    fn nth_distinct(&self, key: u64, n: usize) -> Option<&Arc<Instance>> {
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

pub struct RingHashBalancer {
    vnode_count: u32,
    hash: HashFn,
    first_seen: Mutex<HashMap<String, u64>>,
}

impl RingHashBalancer {
    pub const NAME: &'static str = "ringHash";

    pub fn new(vnode_count: u32, hash: HashFn) -> Self {
        Self {
            vnode_count: vnode_count.max(1),
            hash,
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Current ramp stage per instance plus a signature that changes when
    /// any stage advances, used to refresh the cached ring.
    fn stages(&self, view: &ServiceInstances, now_ms: u64) -> (HashMap<String, u32>, u64) {
        let mut first_seen = self.first_seen.lock();
        let mut stages = HashMap::new();
        let mut signature = 0u64;
        for instance in view.available().instances() {
            let first = *first_seen
                .entry(instance.id().to_string())
                .or_insert(now_ms);
            let pct = ramp_pct(now_ms.saturating_sub(first));
            signature = signature
                .wrapping_mul(31)
                .wrapping_add(crate::hash::fnv1a_64(instance.id().as_bytes()) ^ u64::from(pct));
            stages.insert(instance.id().to_string(), pct);
        }
        (stages, signature)
    }

    fn selector(&self, view: &ServiceInstances) -> Arc<Box<dyn Selector>> {
        let now_ms = clock::now_ms();
        let (stages, signature) = self.stages(view, now_ms);
        let set = view.available();
        let cached = set.selector_or_build(|| {
            Box::new(RingSelector::build(
                view,
                self.vnode_count,
                self.hash,
                &stages,
                signature,
            ))
        });
        let fresh = cached
            .as_any()
            .downcast_ref::<RingSelector>()
            .map_or(false, |selector| selector.stage_signature == signature);
        if fresh {
            return cached;
        }
        set.clear_selector();
        set.selector_or_build(|| {
            Box::new(RingSelector::build(
                view,
                self.vnode_count,
                self.hash,
                &stages,
                signature,
            ))
        })
    }
}

impl LoadBalancer for RingHashBalancer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn choose(&self, instances: &ServiceInstances, criteria: &Criteria) -> Result<Pick> {
        let selector = self.selector(instances);
        let Some(selector) = selector.as_any().downcast_ref::<RingSelector>() else {
            return Err(instance_not_found(instances.service().key()));
        };
        let key = criteria_key(criteria, self.hash);
        let circuit = instances.circuit();
        let candidates = selector.instances.len();
        for extra in 0..candidates.max(1) {
            // Indexes past the set size wrap back onto it.
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
                // Budget exhausted: walk to the next distinct instance.
                continue;
            }
            return Ok(Pick::plain(instance.clone()));
        }
        Err(instance_not_found(instances.service().key()))
    }
}
