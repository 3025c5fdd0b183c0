//! Continuous-failure circuit breaker.
//!
//! Opens after `continuous_threshold` consecutive errors. After
//! `sleep_window_ms` in open the instance becomes half-open (unless an
//! active health checker owns recovery); `success_count_to_close`
//! successes close it, `error_count_to_open` errors re-open it. Records
//! that receive no updates for `metric_expired_ms` are forced closed and
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use mesh_registry_core::CircuitState;

use crate::chain::ChainData;
use crate::{CircuitBreakerPlugin, InstanceGauge};

#[derive(Debug, Clone)]
pub struct ErrorCountConfig {
    pub continuous_threshold: u32,
    pub sleep_window_ms: u64,
    pub request_after_half_open: u32,
    pub success_count_to_close: u32,
    pub metric_expired_ms: u64,
}

impl Default for ErrorCountConfig {
    fn default() -> Self {
        Self {
            continuous_threshold: 10,
            sleep_window_ms: 30_000,
            request_after_half_open: 3,
            success_count_to_close: 2,
            metric_expired_ms: 3_600_000,
        }
    }
}

impl ErrorCountConfig {
    /// Clamps out-of-range values the way a lenient config parser would.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.continuous_threshold == 0 {
            self.continuous_threshold = defaults.continuous_threshold;
        }
        if self.sleep_window_ms == 0 {
            self.sleep_window_ms = defaults.sleep_window_ms;
        }
        if self.request_after_half_open == 0 {
            self.request_after_half_open = defaults.request_after_half_open;
        }
        if self.success_count_to_close == 0 {
            self.success_count_to_close = defaults.success_count_to_close;
        } else if self.success_count_to_close > self.request_after_half_open {
            self.success_count_to_close = self.request_after_half_open;
        }
        if self.metric_expired_ms == 0 {
            self.metric_expired_ms = defaults.metric_expired_ms;
        }
        self
    }

    /// Errors in half-open that force a re-open: enough failures to make
    /// the required success count unreachable.
    pub fn error_count_to_open(&self) -> u32 {
        self.request_after_half_open - self.success_count_to_close + 1
    }
}

#[derive(Debug)]
struct ErrorCountStatus {
    state: RwLock<CircuitState>,
    error_count: AtomicU32,
    success_count: AtomicU32,
    last_update_ms: AtomicU64,
    last_access_ms: AtomicU64,
}

impl ErrorCountStatus {
    fn new(now_ms: u64) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            error_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_update_ms: AtomicU64::new(0),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }

    fn enter(&self, state: CircuitState, now_ms: u64) {
        *self.state.write() = state;
        self.error_count.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        self.last_update_ms.store(now_ms, Ordering::Relaxed);
    }
}

pub struct ErrorCountBreaker {
    config: ErrorCountConfig,
    states: RwLock<HashMap<String, Arc<ErrorCountStatus>>>,
}

impl ErrorCountBreaker {
    pub const NAME: &'static str = "errorCount";

    pub fn new(config: ErrorCountConfig) -> Self {
        Self {
            config: config.normalized(),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ErrorCountConfig {
        &self.config
    }

    fn status(&self, instance_id: &str, now_ms: u64) -> Arc<ErrorCountStatus> {
        if let Some(status) = self.states.read().get(instance_id) {
            status.last_access_ms.store(now_ms, Ordering::Relaxed);
            return status.clone();
        }
        let mut states = self.states.write();
        let status = states
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(ErrorCountStatus::new(now_ms)));
        status.last_access_ms.store(now_ms, Ordering::Relaxed);
        status.clone()
    }
}

impl CircuitBreakerPlugin for ErrorCountBreaker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn half_open_budget(&self) -> u32 {
        self.config.request_after_half_open
    }

    fn on_call_result(&self, chain: &ChainData, idx: usize, gauge: &InstanceGauge, now_ms: u64) {
        let status = self.status(&gauge.instance_id, now_ms);
        let state = *status.state.read();
        if gauge.status.is_failure() {
            match state {
                CircuitState::Closed => {
                    let errors = status.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors >= self.config.continuous_threshold
                        && chain.translate(
                            idx,
                            &gauge.instance_id,
                            CircuitState::Closed,
                            CircuitState::Open,
                        )
                    {
                        status.enter(CircuitState::Open, now_ms);
                    }
                }
                CircuitState::HalfOpen => {
                    let errors = status.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                    // Re-open as soon as the success target is unreachable,
                    // so probe traffic stays bounded under low volume.
                    if errors >= self.config.error_count_to_open()
                        && chain.translate(
                            idx,
                            &gauge.instance_id,
                            CircuitState::HalfOpen,
                            CircuitState::Open,
                        )
                    {
                        status.enter(CircuitState::Open, now_ms);
                    }
                }
                _ => {}
            }
        } else if state == CircuitState::HalfOpen {
            status.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            status.error_count.store(0, Ordering::Relaxed);
        }
    }

    fn timing_pass(&self, chain: &ChainData, idx: usize, now_ms: u64) {
        let snapshot: Vec<(String, Arc<ErrorCountStatus>)> = {
            let states = self.states.read();
            states
                .iter()
                .map(|(id, status)| (id.clone(), status.clone()))
                .collect()
        };
        for (id, status) in &snapshot {
            let state = *status.state.read();
            match state {
                CircuitState::Open => {
                    let opened = status.last_update_ms.load(Ordering::Relaxed);
                    if chain.auto_half_open_enabled()
                        && opened + self.config.sleep_window_ms <= now_ms
                        && chain.translate(idx, id, CircuitState::Open, CircuitState::HalfOpen)
                    {
                        status.enter(CircuitState::HalfOpen, now_ms);
                    }
                }
                CircuitState::HalfOpen => {
                    let successes = status.success_count.load(Ordering::Relaxed);
                    let updated = status.last_update_ms.load(Ordering::Relaxed);
                    if successes >= self.config.success_count_to_close {
                        if chain.translate(idx, id, CircuitState::HalfOpen, CircuitState::Closed) {
                            status.enter(CircuitState::Closed, now_ms);
                        }
                    } else if updated + 20 * self.config.sleep_window_ms <= now_ms {
                        // Not enough probe traffic arrived to decide;
                        // re-open rather than stay half-open forever.
                        if chain.translate(idx, id, CircuitState::HalfOpen, CircuitState::Open) {
                            status.enter(CircuitState::Open, now_ms);
                        }
                    }
                }
                _ => {}
            }
        }

        // Metric expiry: stale records are forced closed and dropped.
        let mut expired = Vec::new();
        for (id, status) in &snapshot {
            let accessed = status.last_access_ms.load(Ordering::Relaxed);
            if accessed + self.config.metric_expired_ms <= now_ms {
                chain.translate(idx, id, CircuitState::Open, CircuitState::Closed);
                chain.translate(idx, id, CircuitState::HalfOpen, CircuitState::Closed);
                chain.forget(id);
                expired.push(id.clone());
            }
        }
        if !expired.is_empty() {
            let mut states = self.states.write();
            for id in expired {
                states.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_registry_core::events::EventListeners;
    use mesh_registry_core::{CallStatus, Service, ServiceKey};

    fn harness() -> (ErrorCountBreaker, ChainData) {
        let breaker = ErrorCountBreaker::new(ErrorCountConfig::default());
        let budget = breaker.half_open_budget();
        let service = Arc::new(Service::new(ServiceKey::new("Test", "echo"), 0));
        let chain = ChainData::new(service, vec![budget], 3, EventListeners::new());
        (breaker, chain)
    }

    fn gauge(status: CallStatus) -> InstanceGauge {
        InstanceGauge {
            service_key: ServiceKey::new("Test", "echo"),
            instance_id: "inst".to_string(),
            status,
            latency_ms: 5,
            subset_key: None,
        }
    }

    #[test]
    fn opens_after_continuous_errors() {
        let (breaker, chain) = harness();
        for _ in 0..9 {
            breaker.on_call_result(&chain, 0, &gauge(CallStatus::Error), 100);
        }
        assert_eq!(chain.state_of("inst"), CircuitState::Closed);
        breaker.on_call_result(&chain, 0, &gauge(CallStatus::Error), 100);
        assert_eq!(chain.state_of("inst"), CircuitState::Open);
    }

    #[test]
    fn success_resets_the_streak() {
        let (breaker, chain) = harness();
        for _ in 0..9 {
            breaker.on_call_result(&chain, 0, &gauge(CallStatus::Error), 100);
        }
        breaker.on_call_result(&chain, 0, &gauge(CallStatus::Ok), 100);
        for _ in 0..9 {
            breaker.on_call_result(&chain, 0, &gauge(CallStatus::Timeout), 100);
        }
        assert_eq!(chain.state_of("inst"), CircuitState::Closed);
    }

    #[test]
    fn sleep_window_promotes_to_half_open() {
        let (breaker, chain) = harness();
        for _ in 0..10 {
            breaker.on_call_result(&chain, 0, &gauge(CallStatus::Error), 1_000);
        }
        breaker.timing_pass(&chain, 0, 1_000 + 29_999);
        assert_eq!(chain.state_of("inst"), CircuitState::Open);
        breaker.timing_pass(&chain, 0, 1_000 + 30_000);
        assert_eq!(chain.state_of("inst"), CircuitState::HalfOpen);
        assert_eq!(chain.service().half_open_budget("inst"), Some(3));
    }

    #[test]
    fn successes_close_from_half_open() {
        let (breaker, chain) = harness();
        for _ in 0..10 {
            breaker.on_call_result(&chain, 0, &gauge(CallStatus::Error), 1_000);
        }
        breaker.timing_pass(&chain, 0, 40_000);
        breaker.on_call_result(&chain, 0, &gauge(CallStatus::Ok), 41_000);
        breaker.on_call_result(&chain, 0, &gauge(CallStatus::Ok), 41_010);
        breaker.timing_pass(&chain, 0, 41_020);
        assert_eq!(chain.state_of("inst"), CircuitState::Closed);
    }

    #[test]
    fn half_open_errors_reopen() {
        let (breaker, chain) = harness();
        for _ in 0..10 {
            breaker.on_call_result(&chain, 0, &gauge(CallStatus::Error), 1_000);
        }
        breaker.timing_pass(&chain, 0, 40_000);
        assert_eq!(chain.state_of("inst"), CircuitState::HalfOpen);
        // error_count_to_open = 3 - 2 + 1 = 2
        breaker.on_call_result(&chain, 0, &gauge(CallStatus::Error), 41_000);
        breaker.on_call_result(&chain, 0, &gauge(CallStatus::Error), 41_010);
        assert_eq!(chain.state_of("inst"), CircuitState::Open);
    }

    #[test]
    fn auto_half_open_can_be_disabled() {
        let (breaker, chain) = harness();
        chain.set_auto_half_open(false);
        for _ in 0..10 {
            breaker.on_call_result(&chain, 0, &gauge(CallStatus::Error), 1_000);
        }
        breaker.timing_pass(&chain, 0, 500_000);
        assert_eq!(chain.state_of("inst"), CircuitState::Open);
    }

    #[test]
    fn stale_metrics_expire_to_closed() {
        let (breaker, chain) = harness();
        for _ in 0..10 {
            breaker.on_call_result(&chain, 0, &gauge(CallStatus::Error), 1_000);
        }
        assert_eq!(chain.state_of("inst"), CircuitState::Open);
        breaker.timing_pass(&chain, 0, 1_000 + 3_600_000);
        assert_eq!(chain.state_of("inst"), CircuitState::Closed);
    }
}
