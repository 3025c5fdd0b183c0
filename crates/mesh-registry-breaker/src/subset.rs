//! Per-subset circuit breaker.
//!
//! Runs the error-ratio machine keyed by the subset label hash instead of
//! the instance id, driven by the gauge's subset key. The derived
//! `{open, preserved}` sets publish to the service side-band consulted by
//! the rule router's priority failover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use mesh_registry_core::{CircuitState, Service, SubsetStateView};

use crate::InstanceGauge;

#[derive(Debug, Clone)]
pub struct SubsetBreakerConfig {
    pub window_ms: u64,
    pub num_buckets: usize,
    pub request_volume_threshold: u32,
    pub error_rate_threshold: f64,
    pub preserve_threshold: f64,
    pub sleep_window_ms: u64,
    pub metric_expired_ms: u64,
}

impl Default for SubsetBreakerConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            num_buckets: 12,
            request_volume_threshold: 10,
            error_rate_threshold: 0.2,
            preserve_threshold: 0.1,
            sleep_window_ms: 30_000,
            metric_expired_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    start_ms: u64,
    total: u32,
    errors: u32,
}

#[derive(Debug)]
struct SubsetStatus {
    state: CircuitState,
    buckets: Vec<Bucket>,
    last_update_ms: u64,
    last_access_ms: u64,
}

impl SubsetStatus {
    fn new(num_buckets: usize, now_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            buckets: vec![Bucket::default(); num_buckets],
            last_update_ms: 0,
            last_access_ms: now_ms,
        }
    }
}

pub struct SubsetBreaker {
    service: Arc<Service>,
    config: SubsetBreakerConfig,
    states: Mutex<HashMap<String, SubsetStatus>>,
    change_seq: AtomicU64,
    enabled: RwLock<bool>,
}

impl SubsetBreaker {
    pub fn new(service: Arc<Service>, config: SubsetBreakerConfig) -> Self {
        Self {
            service,
            config,
            states: Mutex::new(HashMap::new()),
            change_seq: AtomicU64::new(0),
            enabled: RwLock::new(true),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.write() = enabled;
    }

    pub fn state_of(&self, subset_key: &str) -> CircuitState {
        self.states
            .lock()
            .get(subset_key)
            .map(|status| status.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Feeds one call outcome attributed to a subset.
    pub fn on_call_result(&self, gauge: &InstanceGauge, now_ms: u64) {
        if !*self.enabled.read() {
            return;
        }
        let Some(subset_key) = gauge.subset_key.as_deref() else {
            return;
        };
        let mut states = self.states.lock();
        let status = states
            .entry(subset_key.to_string())
            .or_insert_with(|| SubsetStatus::new(self.config.num_buckets, now_ms));
        status.last_access_ms = now_ms;

        let width = (self.config.window_ms / self.config.num_buckets as u64).max(1);
        let aligned = now_ms - now_ms % width;
        let idx = ((now_ms / width) % self.config.num_buckets as u64) as usize;
        let bucket = &mut status.buckets[idx];
        if bucket.start_ms != aligned {
            *bucket = Bucket {
                start_ms: aligned,
                total: 0,
                errors: 0,
            };
        }
        bucket.total += 1;
        if gauge.status.is_failure() {
            bucket.errors += 1;
        }

        let min_start = now_ms.saturating_sub(self.config.window_ms);
        let (mut total, mut errors) = (0u32, 0u32);
        for bucket in &status.buckets {
            if bucket.start_ms >= min_start && bucket.total > 0 {
                total += bucket.total;
                errors += bucket.errors;
            }
        }
        if total < self.config.request_volume_threshold {
            return;
        }
        let rate = errors as f64 / total as f64;
        let next = if rate >= self.config.error_rate_threshold {
            CircuitState::Open
        } else if rate >= self.config.preserve_threshold {
            CircuitState::Preserved
        } else {
            CircuitState::Closed
        };
        if next != status.state && status.state != CircuitState::Open {
            let from = status.state;
            status.state = next;
            status.last_update_ms = now_ms;
            drop(states);
            self.publish(from, next, subset_key);
        }
    }

    /// Timed pass: open subsets re-admit traffic after the sleep window,
    /// stale records expire.
    pub fn timing_pass(&self, now_ms: u64) {
        let mut changed = false;
        {
            let mut states = self.states.lock();
            for status in states.values_mut() {
                if status.state == CircuitState::Open
                    && status.last_update_ms + self.config.sleep_window_ms <= now_ms
                {
                    status.state = CircuitState::Preserved;
                    status.last_update_ms = now_ms;
                    for bucket in status.buckets.iter_mut() {
                        *bucket = Bucket::default();
                    }
                    changed = true;
                }
            }
            let before = states.len();
            states.retain(|_, status| {
                status.last_access_ms + self.config.metric_expired_ms > now_ms
            });
            changed |= states.len() != before;
        }
        if changed {
            self.republish_all();
        }
    }

    fn publish(&self, from: CircuitState, to: CircuitState, subset_key: &str) {
        self.change_seq.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            service = %self.service.key(),
            subset = subset_key,
            ?from,
            ?to,
            "subset circuit transition"
        );
        self.republish_all();
    }

    fn republish_all(&self) {
        let mut view = SubsetStateView::default();
        {
            let states = self.states.lock();
            for (key, status) in states.iter() {
                match status.state {
                    CircuitState::Open => {
                        view.open.insert(key.clone());
                    }
                    CircuitState::Preserved => {
                        view.preserved.insert(key.clone());
                    }
                    _ => {}
                }
            }
        }
        self.service.publish_subsets(view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_registry_core::{CallStatus, ServiceKey};

    fn breaker() -> SubsetBreaker {
        let service = Arc::new(Service::new(ServiceKey::new("Test", "echo"), 0));
        SubsetBreaker::new(service, SubsetBreakerConfig::default())
    }

    fn gauge(status: CallStatus, subset: &str) -> InstanceGauge {
        InstanceGauge {
            service_key: ServiceKey::new("Test", "echo"),
            instance_id: "inst".to_string(),
            status,
            latency_ms: 1,
            subset_key: Some(subset.to_string()),
        }
    }

    #[test]
    fn failing_subset_opens_and_publishes() {
        let breaker = breaker();
        for _ in 0..10 {
            breaker.on_call_result(&gauge(CallStatus::Error, "env=base#r1"), 5_000);
        }
        assert_eq!(breaker.state_of("env=base#r1"), CircuitState::Open);
        let view = breaker.service.subset_view();
        assert!(view.open.contains("env=base#r1"));
        assert_eq!(breaker.state_of("env=canary#r1"), CircuitState::Closed);
    }

    #[test]
    fn open_subset_relaxes_to_preserved_after_sleep() {
        let breaker = breaker();
        for _ in 0..10 {
            breaker.on_call_result(&gauge(CallStatus::Error, "env=base#r1"), 5_000);
        }
        breaker.timing_pass(5_000 + 30_000);
        assert_eq!(breaker.state_of("env=base#r1"), CircuitState::Preserved);
        let view = breaker.service.subset_view();
        assert!(view.preserved.contains("env=base#r1"));
        assert!(!view.open.contains("env=base#r1"));
    }

    #[test]
    fn recovered_subset_closes() {
        let breaker = breaker();
        for _ in 0..10 {
            breaker.on_call_result(&gauge(CallStatus::Error, "s"), 5_000);
        }
        breaker.timing_pass(35_000);
        for _ in 0..20 {
            breaker.on_call_result(&gauge(CallStatus::Ok, "s"), 36_000);
        }
        assert_eq!(breaker.state_of("s"), CircuitState::Closed);
        let view = breaker.service.subset_view();
        assert!(view.open.is_empty());
        assert!(view.preserved.is_empty());
    }

    #[test]
    fn gauges_without_subset_are_ignored() {
        let breaker = breaker();
        let mut g = gauge(CallStatus::Error, "unused");
        g.subset_key = None;
        for _ in 0..50 {
            breaker.on_call_result(&g, 5_000);
        }
        assert!(breaker.service.subset_view().open.is_empty());
    }
}
