//! Locality-aware balancer.
//!
//! Keeps a per-instance weight derived from observed latency and in-flight
//! count, picks by weighted traversal of the prefix-sum tree, and embeds a
//! 20-bit route key plus the pick's begin time in the returned handle so
//! the matching feedback adjusts the right node. Feedback decoded to a
//! begin time in the future (a wrapped or reused handle) is dropped and
//! counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use mesh_registry_core::{clock, Criteria, LocalityPick, Result, ServiceInstances, ServiceKey};

use crate::{instance_not_found, CallFeedback, LoadBalancer, Pick};

const ROUTE_KEY_SPACE: u32 = 1 << 20;

#[derive(Debug, Clone)]
pub struct LocalityConfig {
    /// Smoothing factor of the latency EMA, in (0, 1].
    pub latency_alpha: f64,
    /// Weight floor so a slow instance keeps receiving trickle traffic.
    pub min_weight: f64,
    /// Latency assumed for instances that have no feedback yet.
    pub initial_latency_ms: f64,
}

impl Default for LocalityConfig {
    fn default() -> Self {
        Self {
            latency_alpha: 0.3,
            min_weight: 0.01,
            initial_latency_ms: 50.0,
        }
    }
}

#[derive(Debug)]
struct Node {
    instance_id: String,
    route_key: u32,
    base_weight: f64,
    /// f64 bits; the EMA is read on every pick and written on feedback.
    latency_ema_bits: AtomicU64,
    inflight: AtomicI64,
}

impl Node {
    fn latency_ema_ms(&self) -> f64 {
        f64::from_bits(self.latency_ema_bits.load(Ordering::Relaxed))
    }

    fn set_latency_ema_ms(&self, value: f64) {
        self.latency_ema_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    fn effective_weight(&self, config: &LocalityConfig) -> f64 {
        let inflight = self.inflight.load(Ordering::Relaxed).max(0) as f64;
        let weight = self.base_weight / ((self.latency_ema_ms() + 1.0) * (inflight + 1.0));
        weight.max(config.min_weight)
    }
}

#[derive(Default)]
struct ServiceState {
    nodes: HashMap<String, Arc<Node>>,
    by_route_key: HashMap<u32, String>,
    next_route_key: u32,
}

pub struct LocalityAwareBalancer {
    config: LocalityConfig,
    services: Mutex<HashMap<ServiceKey, ServiceState>>,
    stale_feedback: AtomicU64,
}

impl LocalityAwareBalancer {
    pub const NAME: &'static str = "localityAware";

    pub fn new(config: LocalityConfig) -> Self {
        Self {
            config,
            services: Mutex::new(HashMap::new()),
            stale_feedback: AtomicU64::new(0),
        }
    }

    /// Feedback handles dropped because their begin time post-dated the
    /// clock.
    pub fn stale_feedback_count(&self) -> u64 {
        self.stale_feedback.load(Ordering::Relaxed)
    }

    fn sync_nodes(&self, state: &mut ServiceState, view: &ServiceInstances) {
        for instance in view.available().instances() {
            if state.nodes.contains_key(instance.id()) {
                continue;
            }
            let route_key = state.next_route_key % ROUTE_KEY_SPACE;
            state.next_route_key = state.next_route_key.wrapping_add(1);
            let node = Arc::new(Node {
                instance_id: instance.id().to_string(),
                route_key,
                base_weight: f64::from(instance.weight().max(1)),
                latency_ema_bits: AtomicU64::new(self.config.initial_latency_ms.to_bits()),
                inflight: AtomicI64::new(0),
            });
            state.by_route_key.insert(route_key, node.instance_id.clone());
            state.nodes.insert(node.instance_id.clone(), node);
        }
    }
}

impl LoadBalancer for LocalityAwareBalancer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn choose(&self, instances: &ServiceInstances, criteria: &Criteria) -> Result<Pick> {
        let members = instances.available().instances();
        if members.is_empty() {
            return Err(instance_not_found(instances.service().key()));
        }
        let circuit = instances.circuit();
        let mut services = self.services.lock();
        let state = services
            .entry(instances.service().key().clone())
            .or_default();
        self.sync_nodes(state, instances);

        // Prefix sums over the effective weights of selectable members.
        let mut bounds = Vec::with_capacity(members.len());
        let mut sum = 0.0f64;
        for instance in members {
            let is_half_open = circuit.half_open.contains_key(instance.id());
            if is_half_open && !criteria.ignore_half_open {
                if !instances.service().try_claim_half_open(instance.id()) {
                    continue;
                }
                // A claimed probe short-circuits the weighted pick.
                let node = state.nodes.get(instance.id());
                let pick = node.map(|node| {
                    node.inflight.fetch_add(1, Ordering::Relaxed);
                    LocalityPick::pack(node.route_key, clock::now_ms())
                });
                return Ok(Pick {
                    instance: instance.clone(),
                    locality: pick,
                });
            }
            let Some(node) = state.nodes.get(instance.id()) else {
                continue;
            };
            sum += node.effective_weight(&self.config);
            bounds.push((sum, instance.clone(), node.clone()));
        }
        if bounds.is_empty() || sum <= 0.0 {
            return Err(instance_not_found(instances.service().key()));
        }
        let roll: f64 = rand::rng().random_range(0.0..sum);
        let index = bounds.partition_point(|(bound, _, _)| *bound <= roll);
        let (_, instance, node) = bounds
            .get(index)
            .or_else(|| bounds.last())
            .cloned()
            .ok_or_else(|| instance_not_found(instances.service().key()))?;
        node.inflight.fetch_add(1, Ordering::Relaxed);
        let handle = LocalityPick::pack(node.route_key, clock::now_ms());
        Ok(Pick {
            instance,
            locality: Some(handle),
        })
    }

    fn update_call_result(&self, feedback: &CallFeedback) {
        let Some(handle) = feedback.locality else {
            return;
        };
        let now_ms = clock::now_ms();
        if handle.elapsed_ms(now_ms).is_none() {
            self.stale_feedback.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut services = self.services.lock();
        let Some(state) = services.get_mut(&feedback.service_key) else {
            return;
        };
        let Some(instance_id) = state.by_route_key.get(&handle.route_key()).cloned() else {
            self.stale_feedback.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if instance_id != feedback.instance_id {
            // Route key was recycled to a different instance.
            self.stale_feedback.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(node) = state.nodes.get(&instance_id) {
            node.inflight.fetch_sub(1, Ordering::Relaxed);
            let observed = if feedback.success {
                feedback.latency_ms as f64
            } else {
                // Failures count as very slow so the weight decays.
                (feedback.latency_ms as f64).max(1000.0)
            };
            let updated = node.latency_ema_ms() * (1.0 - self.config.latency_alpha)
                + observed * self.config.latency_alpha;
            node.set_latency_ema_ms(updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn feedback(
        view: &ServiceInstances,
        pick: &Pick,
        latency_ms: u64,
        success: bool,
    ) -> CallFeedback {
        CallFeedback {
            service_key: view.service().key().clone(),
            instance_id: pick.instance.id().to_string(),
            locality: pick.locality,
            latency_ms,
            success,
        }
    }

    #[test]
    fn picks_carry_route_keys() {
        let view = instances_view(vec![weighted("A", 8001, 100), weighted("B", 8002, 100)]);
        let lb = LocalityAwareBalancer::new(LocalityConfig::default());
        let pick = lb.choose(&view, &Criteria::default()).unwrap();
        assert!(pick.locality.is_some());
    }

    #[test]
    fn slow_instance_loses_traffic() {
        let view = instances_view(vec![weighted("fast", 8001, 100), weighted("slow", 8002, 100)]);
        let lb = LocalityAwareBalancer::new(LocalityConfig::default());
        // Train: slow instance reports large latencies.
        for _ in 0..200 {
            let pick = lb.choose(&view, &Criteria::default()).unwrap();
            let latency = if pick.instance.id() == "slow" { 900 } else { 5 };
            lb.update_call_result(&feedback(&view, &pick, latency, true));
        }
        let mut slow_picks = 0;
        for _ in 0..200 {
            let pick = lb.choose(&view, &Criteria::default()).unwrap();
            let latency = if pick.instance.id() == "slow" { 900 } else { 5 };
            if pick.instance.id() == "slow" {
                slow_picks += 1;
            }
            lb.update_call_result(&feedback(&view, &pick, latency, true));
        }
        assert!(slow_picks < 60, "slow picked {slow_picks} of 200");
    }

    #[test]
    fn stale_feedback_is_dropped() {
        let view = instances_view(vec![weighted("A", 8001, 100)]);
        let lb = LocalityAwareBalancer::new(LocalityConfig::default());
        let pick = lb.choose(&view, &Criteria::default()).unwrap();
        let mut fake = feedback(&view, &pick, 5, true);
        // A begin time far in the future can only be a wrapped handle.
        fake.locality = Some(LocalityPick::pack(
            pick.locality.unwrap().route_key(),
            clock::now_ms() + 1_000_000,
        ));
        lb.update_call_result(&fake);
        assert_eq!(lb.stale_feedback_count(), 1);
    }

    #[test]
    fn unknown_route_key_counts_stale() {
        let view = instances_view(vec![weighted("A", 8001, 100)]);
        let lb = LocalityAwareBalancer::new(LocalityConfig::default());
        let pick = lb.choose(&view, &Criteria::default()).unwrap();
        let mut fake = feedback(&view, &pick, 5, true);
        fake.locality = Some(LocalityPick::pack(99_999, clock::now_ms()));
        lb.update_call_result(&fake);
        assert_eq!(lb.stale_feedback_count(), 1);
    }
}
